use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LENGTH: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Session,
    Message,
    Permission,
    ToolCall,
    Handler,
    Event,
}

impl Prefix {
    fn as_str(&self) -> &'static str {
        match self {
            Prefix::Session => "ses",
            Prefix::Message => "msg",
            Prefix::Permission => "per",
            Prefix::ToolCall => "call",
            Prefix::Handler => "hnd",
            Prefix::Event => "evt",
        }
    }
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);
static COUNTER: Mutex<u32> = Mutex::new(0);

fn random_base62(length: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut result = String::with_capacity(length);
    for _ in 0..length {
        let idx = rng.gen_range(0..62);
        result.push(BASE62_CHARS[idx] as char);
    }
    result
}

/// Create a prefixed id whose first component sorts by creation time.
/// Millisecond timestamps share a monotonic counter so ids created in the
/// same millisecond still sort in creation order.
pub fn create(prefix: Prefix) -> String {
    let current_timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    if current_timestamp != last {
        LAST_TIMESTAMP.store(current_timestamp, Ordering::Relaxed);
        let mut counter = COUNTER.lock().unwrap();
        *counter = 0;
    }

    let counter_val = {
        let mut counter = COUNTER.lock().unwrap();
        *counter += 1;
        *counter
    };

    let now = current_timestamp * 0x1000 + u64::from(counter_val);

    let mut time_bytes = [0u8; 6];
    for (i, byte) in time_bytes.iter_mut().enumerate() {
        *byte = ((now >> (40 - 8 * i)) & 0xff) as u8;
    }

    let hex_time = hex::encode(time_bytes);
    let random_part = random_base62(LENGTH - 12);

    format!("{}_{}{}", prefix.as_str(), hex_time, random_part)
}

pub fn validate_prefix(id: &str, expected: Prefix) -> bool {
    id.starts_with(expected.as_str())
}
