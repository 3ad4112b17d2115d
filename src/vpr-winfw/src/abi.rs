//! Fixed-layout ABI types and their conversion into owned values
//!
//! Every pointer handed to us is read exactly once, bounds-checked, and
//! copied into the policy engine's own types before any policy work starts.
//! Structs are packed to match the C declarations in `include/winfw.h`.

use std::ptr;

use vpr_firewall::{PingableHosts, PolicyError, Protocol, Relay, Result, Settings};

/// Platform `wchar_t`.
#[cfg(windows)]
pub type WChar = u16;
#[cfg(not(windows))]
pub type WChar = u32;

/// Longest accepted wide string, terminator excluded
pub const MAX_WIDE_LEN: usize = 4096;
/// Most pingable hosts accepted in one call
pub const MAX_PINGABLE_HOSTS: usize = 1024;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct WinFwSettings {
    /// Nonzero permits DHCP
    pub permit_dhcp: u8,
    /// Nonzero permits LAN traffic
    pub permit_lan: u8,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct WinFwRelay {
    pub ip: *const WChar,
    pub port: u16,
    /// `0` TCP, `1` UDP
    pub protocol: u8,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct WinFwPingableHosts {
    /// Optional; null means any interface
    pub tunnel_interface_alias: *const WChar,
    pub hosts: *const *const WChar,
    pub num_hosts: usize,
}

const _: () = assert!(std::mem::size_of::<WinFwSettings>() == 2);
const _: () = assert!(
    std::mem::size_of::<WinFwRelay>() == std::mem::size_of::<*const WChar>() + 3
);
const _: () = assert!(
    std::mem::size_of::<WinFwPingableHosts>()
        == 2 * std::mem::size_of::<*const WChar>() + std::mem::size_of::<usize>()
);

fn invalid(msg: impl Into<String>) -> PolicyError {
    PolicyError::InvalidInput(msg.into())
}

/// Read a struct the caller passed by pointer.
///
/// # Safety
/// `ptr` must be null or point to a readable `T`.
unsafe fn read_struct<T: Copy>(what: &str, ptr: *const T) -> Result<T> {
    if ptr.is_null() {
        return Err(invalid(format!("{what} is null")));
    }
    Ok(ptr::read_unaligned(ptr))
}

/// Decode a NUL-terminated wide string of at most [`MAX_WIDE_LEN`] units.
///
/// # Safety
/// `ptr` must be null or point to a wide string that is readable up to its
/// terminator or `MAX_WIDE_LEN + 1` units, whichever comes first.
pub unsafe fn read_wide(what: &str, ptr: *const WChar) -> Result<String> {
    if ptr.is_null() {
        return Err(invalid(format!("{what} is null")));
    }
    let mut units = Vec::new();
    for i in 0..=MAX_WIDE_LEN {
        let unit = ptr::read_unaligned(ptr.add(i));
        if unit == 0 {
            return decode_units(&units)
                .ok_or_else(|| invalid(format!("{what} is not valid text")));
        }
        units.push(unit);
    }
    Err(invalid(format!("{what} is too long or not terminated")))
}

/// Like [`read_wide`], but null means absent.
///
/// # Safety
/// Same as [`read_wide`].
pub unsafe fn read_optional_wide(what: &str, ptr: *const WChar) -> Result<Option<String>> {
    if ptr.is_null() {
        return Ok(None);
    }
    read_wide(what, ptr).map(Some)
}

#[cfg(windows)]
fn decode_units(units: &[WChar]) -> Option<String> {
    String::from_utf16(units).ok()
}

#[cfg(not(windows))]
fn decode_units(units: &[WChar]) -> Option<String> {
    units.iter().map(|&u| char::from_u32(u)).collect()
}

/// NUL-terminated wide copy of `s`, for callers embedding the library from Rust.
pub fn to_wide(s: &str) -> Vec<WChar> {
    #[cfg(windows)]
    let mut units: Vec<WChar> = s.encode_utf16().collect();
    #[cfg(not(windows))]
    let mut units: Vec<WChar> = s.chars().map(|c| c as WChar).collect();
    units.push(0);
    units
}

/// # Safety
/// `ptr` must be null or point to a readable [`WinFwSettings`].
pub unsafe fn read_settings(ptr: *const WinFwSettings) -> Result<Settings> {
    let raw = read_struct("settings", ptr)?;
    Ok(Settings::new(raw.permit_dhcp != 0, raw.permit_lan != 0))
}

/// # Safety
/// `ptr` must be null or point to a readable [`WinFwRelay`] whose `ip`
/// satisfies [`read_wide`].
pub unsafe fn read_relay(ptr: *const WinFwRelay) -> Result<Relay> {
    let raw = read_struct("relay", ptr)?;
    let ip = raw.ip;
    let port = raw.port;
    let protocol = Protocol::try_from(raw.protocol)
        .map_err(|value| invalid(format!("unknown relay protocol {value}")))?;
    let address = read_wide("relay address", ip)?;
    Ok(Relay::new(address, port, protocol))
}

/// # Safety
/// `ptr` must be null or point to a readable [`WinFwPingableHosts`] whose
/// `hosts` array holds `num_hosts` strings satisfying [`read_wide`].
pub unsafe fn read_pingable_hosts(ptr: *const WinFwPingableHosts) -> Result<PingableHosts> {
    if ptr.is_null() {
        return Ok(PingableHosts::default());
    }
    let raw = read_struct("pingable hosts", ptr)?;
    let count = raw.num_hosts;
    let hosts_ptr = raw.hosts;
    if count > MAX_PINGABLE_HOSTS {
        return Err(invalid(format!("too many pingable hosts: {count}")));
    }
    if count > 0 && hosts_ptr.is_null() {
        return Err(invalid("pingable host list is null"));
    }

    let mut hosts = Vec::with_capacity(count);
    for i in 0..count {
        let host = ptr::read_unaligned(hosts_ptr.add(i));
        hosts.push(read_wide("pingable host", host)?);
    }
    let mut pingable = PingableHosts::new(hosts);
    if let Some(alias) = read_optional_wide("tunnel interface alias", raw.tunnel_interface_alias)? {
        pingable = pingable.on_interface(alias);
    }
    Ok(pingable)
}
