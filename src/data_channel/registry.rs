use crate::data_channel::DataChannel;
use crate::role::Role;
use std::collections::BTreeMap;

/// `sid -> DataChannel` registry. Local-initiated channels take even sids when
/// this endpoint is `Client`, odd when `Server` (matching WebRTC's even/odd
/// split so both peers can allocate without colliding). Allocation is an
/// unbounded upward scan for the first free slot of the correct parity — the
/// original implementation capped this scan at a fixed array size, which is a
/// bug (it silently fails once that many channels of one parity exist) and is
/// not replicated here.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<u16, DataChannel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// First free sid of the correct parity for a locally-initiated channel.
    pub fn next_local_sid(&self, role: Role) -> u16 {
        let base: u16 = match role {
            Role::Client => 0,
            Role::Server => 1,
        };
        let mut sid = base;
        while self.channels.contains_key(&sid) {
            sid += 2;
        }
        sid
    }

    pub fn insert(&mut self, channel: DataChannel) {
        self.channels.insert(channel.sid, channel);
    }

    pub fn get(&self, sid: u16) -> Option<&DataChannel> {
        self.channels.get(&sid)
    }

    pub fn get_mut(&mut self, sid: u16) -> Option<&mut DataChannel> {
        self.channels.get_mut(&sid)
    }

    pub fn remove(&mut self, sid: u16) -> Option<DataChannel> {
        self.channels.remove(&sid)
    }

    pub fn contains(&self, sid: u16) -> bool {
        self.channels.contains_key(&sid)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data_channel::ChannelKind;

    fn chan(sid: u16) -> DataChannel {
        DataChannel::new_connecting(sid, ChannelKind::ReliableOrdered, "x".into(), "".into(), 0)
    }

    #[test]
    fn test_client_allocates_even_sids() {
        let mut reg = ChannelRegistry::new();
        assert_eq!(reg.next_local_sid(Role::Client), 0);
        reg.insert(chan(0));
        assert_eq!(reg.next_local_sid(Role::Client), 2);
        reg.insert(chan(2));
        assert_eq!(reg.next_local_sid(Role::Client), 4);
    }

    #[test]
    fn test_server_allocates_odd_sids() {
        let mut reg = ChannelRegistry::new();
        assert_eq!(reg.next_local_sid(Role::Server), 1);
        reg.insert(chan(1));
        assert_eq!(reg.next_local_sid(Role::Server), 3);
    }

    #[test]
    fn test_allocation_fills_gaps() {
        let mut reg = ChannelRegistry::new();
        reg.insert(chan(0));
        reg.insert(chan(2));
        reg.insert(chan(4));
        reg.remove(2);
        assert_eq!(reg.next_local_sid(Role::Client), 2);
    }

    #[test]
    fn test_registry_contains_iff_present() {
        let mut reg = ChannelRegistry::new();
        assert!(!reg.contains(6));
        reg.insert(chan(6));
        assert!(reg.contains(6));
        reg.remove(6);
        assert!(!reg.contains(6));
    }
}
