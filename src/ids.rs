use std::sync::{Mutex, OnceLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// Length of a session identifier: 16 random bytes, Base64-encoded.
pub(crate) const SESSION_ID_LENGTH: usize = 24;

/// Milliseconds of 2017-01-01 since 1970-01-01, the CUID epoch.
const CUID_EPOCH_MS: i64 = 1_483_228_800_000;

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Generates a random 128-bit session identifier, encoded as 24 characters
/// of standard-alphabet Base64. Collision probability is close to zero.
pub(crate) fn generate_session_id() -> Result<String> {
    let mut bytes = [0u8; 16];
    OsRng.try_fill_bytes(&mut bytes).map_err(Error::Generation)?;
    Ok(STANDARD.encode(bytes))
}

/// Returns a random Base62-encoded string with the given length. To avoid
/// collisions, use a length of at least 22, which corresponds to a minimum
/// of 128 bits.
pub fn random_id(length: usize) -> Result<String> {
    let mut bytes = vec![0u8; length];
    OsRng.try_fill_bytes(&mut bytes).map_err(Error::Generation)?;
    Ok(bytes
        .into_iter()
        .map(|byte| BASE62[usize::from(byte) % BASE62.len()] as char)
        .collect())
}

struct CuidState {
    last_time: u64,
    counter: u64,
}

static CUID_STATE: Mutex<CuidState> = Mutex::new(CuidState {
    last_time: 0,
    counter: 0,
});

/// Returns a compact unique identifier suitable for user IDs. The goal is
/// to minimize collisions while keeping the identifier short. The returned
/// identifiers are exactly 11 characters long, consisting of letters and
/// numbers (Base62). They are generated from a 64-bit value with the
/// following fields:
///
/// - Bits 64-25: a timestamp, the number of milliseconds since Jan 1, 2017,
///   omitting all bits above bit 40. Timestamps start over about every 34
///   years; within such a period, identifiers sort lexicographically.
/// - Bits 24-9: a 16-bit hash of this machine's MAC address.
/// - Bits 8-1: a counter which increases with every call that lands on the
///   same timestamp. Bits 8 and above, if any, spill into the address hash.
pub fn cuid() -> String {
    let mut state = CUID_STATE.lock().unwrap();

    let now = Utc::now();
    let timestamp = (now.timestamp_millis() - CUID_EPOCH_MS) as u64 & ((1 << 40) - 1);

    if timestamp == state.last_time {
        state.counter += 1;
    } else {
        state.counter = 0;
    }
    state.last_time = timestamp;
    let counter = state.counter & 0xff;

    let mut node = node_hash();
    let spill = state.counter >> 8;
    if spill != 0 {
        node = node.wrapping_add((spill & 0xffff) as u16);
    }

    let mut bits = (timestamp << 24) | (u64::from(node) << 8) | counter;

    let mut encoded = [0u8; 11];
    for slot in encoded.iter_mut().rev() {
        *slot = BASE62[(bits % 62) as usize];
        bits /= 62;
    }
    encoded.iter().map(|&byte| byte as char).collect()
}

/// 16-bit hash of the machine's hardware address, derived once.
fn node_hash() -> u16 {
    static NODE_HASH: OnceLock<u16> = OnceLock::new();
    *NODE_HASH.get_or_init(|| {
        node_address()
            .iter()
            .fold(0u16, |hash, &byte| hash.wrapping_mul(31).wrapping_add(u16::from(byte)))
    })
}

/// The first non-zero hardware address of this machine, or random bytes on
/// platforms where none can be discovered.
#[cfg(target_os = "linux")]
fn node_address() -> [u8; 6] {
    if let Ok(interfaces) = std::fs::read_dir("/sys/class/net") {
        for interface in interfaces.flatten() {
            let Ok(text) = std::fs::read_to_string(interface.path().join("address")) else {
                continue;
            };
            if let Some(address) = parse_hardware_address(text.trim()) {
                return address;
            }
        }
    }
    random_node_address()
}

#[cfg(not(target_os = "linux"))]
fn node_address() -> [u8; 6] {
    random_node_address()
}

#[cfg(target_os = "linux")]
fn parse_hardware_address(text: &str) -> Option<[u8; 6]> {
    let mut address = [0u8; 6];
    let mut octets = text.split(':');
    for slot in address.iter_mut() {
        *slot = u8::from_str_radix(octets.next()?, 16).ok()?;
    }
    if octets.next().is_none() && address.iter().any(|&byte| byte != 0) {
        Some(address)
    } else {
        None
    }
}

fn random_node_address() -> [u8; 6] {
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// 64-bit FNV-1a fingerprint of a `User-Agent` header, or 0 when the header
/// is absent. The hash is deliberately stable across builds and restarts
/// because it is persisted with the session.
pub(crate) fn agent_fingerprint(user_agent: &str) -> u64 {
    if user_agent.is_empty() {
        return 0;
    }
    fnv1a_64(user_agent.as_bytes())
}

fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}
