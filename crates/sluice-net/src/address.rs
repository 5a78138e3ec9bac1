//! Local IPv4 address table: is a peer this machine, or on one of its subnets?

use std::io;
use std::net::{IpAddr, Ipv4Addr};

use tracing::debug;

/// The host's IPv4 addresses, each with its subnet mask.
///
/// Built once and read-only afterwards, so it can be shared freely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressTable {
    /// (address, mask) as host-order integers.
    entries: Vec<(u32, u32)>,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Ipv4Addr, Ipv4Addr)>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(address, mask)| (u32::from(address), u32::from(mask)))
                .collect(),
        }
    }

    /// Add an address and mask given as raw octets.
    ///
    /// Anything that is not exactly four bytes on both sides is skipped.
    pub fn add_address(&mut self, address: &[u8], mask: &[u8]) {
        if let (Some(address), Some(mask)) = (octets(address), octets(mask)) {
            self.entries
                .push((u32::from_be_bytes(address), u32::from_be_bytes(mask)));
        }
    }

    /// Enumerate the IPv4 addresses of the host's network interfaces.
    #[cfg(unix)]
    pub fn from_host() -> io::Result<Self> {
        let mut table = Self::new();
        for (address, mask) in ifaddrs::ipv4_interfaces()? {
            table.add_address(&address.octets(), &mask.octets());
        }
        debug!(addresses = table.len(), "loaded local IPv4 addresses");
        Ok(table)
    }

    #[cfg(not(unix))]
    pub fn from_host() -> io::Result<Self> {
        debug!("interface enumeration unsupported on this platform");
        Ok(Self::new())
    }

    /// True if `address` is exactly one of the local addresses.
    pub fn is_same_machine(&self, address: &[u8]) -> bool {
        let Some(address) = octets(address) else {
            return false;
        };
        let address = u32::from_be_bytes(address);
        self.entries.iter().any(|&(local, _)| local == address)
    }

    /// True if `address` shares a subnet with any local address.
    pub fn is_same_lan(&self, address: &[u8]) -> bool {
        let Some(address) = octets(address) else {
            return false;
        };
        let address = u32::from_be_bytes(address);
        self.entries
            .iter()
            .any(|&(local, mask)| (address & mask) == (local & mask))
    }

    /// [`is_same_machine`](Self::is_same_machine) for an `IpAddr`.
    /// IPv4-mapped IPv6 addresses are unwrapped; other IPv6 never matches.
    pub fn is_same_machine_ip(&self, ip: IpAddr) -> bool {
        to_ipv4(ip).is_some_and(|v4| self.is_same_machine(&v4.octets()))
    }

    pub fn is_same_lan_ip(&self, ip: IpAddr) -> bool {
        to_ipv4(ip).is_some_and(|v4| self.is_same_lan(&v4.octets()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ipv4Addr, Ipv4Addr)> + '_ {
        self.entries
            .iter()
            .map(|&(address, mask)| (Ipv4Addr::from(address), Ipv4Addr::from(mask)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn octets(bytes: &[u8]) -> Option<[u8; 4]> {
    bytes.try_into().ok()
}

fn to_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
mod ifaddrs {
    use std::io;
    use std::net::Ipv4Addr;
    use std::ptr;

    /// IPv4 (address, netmask) of every interface that has both.
    pub(super) fn ipv4_interfaces() -> io::Result<Vec<(Ipv4Addr, Ipv4Addr)>> {
        let mut head: *mut libc::ifaddrs = ptr::null_mut();
        // SAFETY: getifaddrs writes a list head we free below.
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut found = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            // SAFETY: cursor walks the list getifaddrs returned; entries stay
            // valid until freeifaddrs.
            let entry = unsafe { &*cursor };
            // SAFETY: both pointers are checked for null and for AF_INET
            // before being read as sockaddr_in.
            if let (Some(address), Some(mask)) =
                unsafe { (ipv4(entry.ifa_addr), ipv4(entry.ifa_netmask)) }
            {
                found.push((address, mask));
            }
            cursor = entry.ifa_next;
        }

        // SAFETY: head came from a successful getifaddrs and is freed once.
        unsafe { libc::freeifaddrs(head) };
        Ok(found)
    }

    /// # Safety
    ///
    /// `sa` must be null or point to a valid `sockaddr`.
    unsafe fn ipv4(sa: *const libc::sockaddr) -> Option<Ipv4Addr> {
        if sa.is_null() || i32::from((*sa).sa_family) != libc::AF_INET {
            return None;
        }
        let sin = &*sa.cast::<libc::sockaddr_in>();
        // s_addr is already in network byte order.
        Some(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()))
    }
}
