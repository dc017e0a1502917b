//! Sortable, prefixed identifiers.
//!
//! Every record carries a `{prefix}_{token}` ID where the token is a
//! lowercase Crockford-base32 value shaped like a ULID: 48 bits of
//! millisecond timestamp followed by 80 bits of randomness. Within one
//! process the random tail is bumped monotonically when two IDs land in
//! the same millisecond, so lexicographic order always agrees with mint
//! order.

use parking_lot::Mutex;

/// Crockford base32, lowercased. Sort order of the encoded text matches
/// numeric order of the input, which is what makes the IDs sortable.
const ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

const TIME_CHARS: usize = 10; // 48-bit timestamp
const RAND_CHARS: usize = 16; // 80-bit randomness

/// The record families maestro mints IDs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdPrefix {
    Session,
    Message,
    Part,
    Tool,
    Question,
}

impl IdPrefix {
    /// The three-letter prefix used in the rendered ID.
    pub fn as_str(self) -> &'static str {
        match self {
            IdPrefix::Session => "ses",
            IdPrefix::Message => "msg",
            IdPrefix::Part => "prt",
            IdPrefix::Tool => "tol",
            IdPrefix::Question => "qst",
        }
    }
}

/// Monotonic state: the last timestamp handed out and the 80-bit random
/// tail used at that timestamp.
struct MintState {
    last_millis: u64,
    last_rand: u128,
}

static STATE: Mutex<MintState> = Mutex::new(MintState {
    last_millis: 0,
    last_rand: 0,
});

/// ULID-style identifier generator.
pub struct Identifier;

impl Identifier {
    /// Mint a new sortable ID with the given prefix.
    pub fn generate(prefix: IdPrefix) -> String {
        let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;

        let (millis, rand) = {
            let mut state = STATE.lock();
            if millis <= state.last_millis {
                // Same (or regressed) millisecond: bump the random tail so
                // the new ID still sorts after the previous one.
                state.last_rand = state.last_rand.wrapping_add(1) & ((1u128 << 80) - 1);
            } else {
                state.last_millis = millis;
                state.last_rand = random_80bits();
            }
            (state.last_millis, state.last_rand)
        };

        let mut token = String::with_capacity(TIME_CHARS + RAND_CHARS);
        encode_base32(millis as u128, TIME_CHARS, &mut token);
        encode_base32(rand, RAND_CHARS, &mut token);

        format!("{}_{}", prefix.as_str(), token)
    }

    /// Alias of [`generate`](Self::generate) kept for call sites that want
    /// to state the sort direction explicitly.
    pub fn ascending(prefix: IdPrefix) -> String {
        Self::generate(prefix)
    }

    /// Descending IDs are documented but currently produce the same output
    /// as ascending ones; reverse-chronological consumers sort at read
    /// time instead.
    pub fn descending(prefix: IdPrefix) -> String {
        Self::generate(prefix)
    }

    /// Split an ID into its `(prefix, token)` halves.
    pub fn parse(id: &str) -> crate::Result<(&str, &str)> {
        id.split_once('_')
            .filter(|(prefix, token)| !prefix.is_empty() && !token.is_empty())
            .ok_or_else(|| crate::Error::Other(format!("invalid ID format: {id}")))
    }

    /// Check that `id` carries the expected prefix.
    pub fn validate(id: &str, expected: IdPrefix) -> bool {
        match Self::parse(id) {
            Ok((prefix, _)) => prefix == expected.as_str(),
            Err(_) => false,
        }
    }
}

fn random_80bits() -> u128 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let mut value: u128 = 0;
    for b in &bytes[..10] {
        value = (value << 8) | *b as u128;
    }
    value
}

/// Encode the low `chars * 5` bits of `value`, most significant first.
fn encode_base32(value: u128, chars: usize, out: &mut String) {
    for i in (0..chars).rev() {
        let idx = ((value >> (i * 5)) & 0x1f) as usize;
        out.push(ALPHABET[idx] as char);
    }
}
