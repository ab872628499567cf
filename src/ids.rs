use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Digits used for correlation IDs: `0-9` followed by `a-z`.
pub const ALPHABET_36: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

/// Error returned by the base encoders.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn digits(alphabet: &str) -> Result<Vec<char>, EncodeError> {
    let digits: Vec<char> = alphabet.chars().collect();
    if digits.len() < 2 {
        return Err(EncodeError::InvalidArgument(format!(
            "alphabet must have at least 2 digits, got {}",
            digits.len()
        )));
    }
    let unique: HashSet<&char> = digits.iter().collect();
    if unique.len() != digits.len() {
        return Err(EncodeError::InvalidArgument(
            "alphabet contains duplicate digits".to_string(),
        ));
    }
    Ok(digits)
}

/// Encode `number` in the base given by `alphabet`, most significant
/// digit first. Zero encodes as the first digit of the alphabet.
pub fn to_base(number: u128, alphabet: &str) -> Result<String, EncodeError> {
    Ok(encode_digits(number, &digits(alphabet)?))
}

/// `digits` must already be validated: at least two, all distinct.
fn encode_digits(number: u128, digits: &[char]) -> String {
    if number == 0 {
        return digits[0].to_string();
    }

    let base = digits.len() as u128;
    let mut n = number;
    let mut out = Vec::new();
    while n != 0 {
        out.push(digits[(n % base) as usize]);
        n /= base;
    }
    out.into_iter().rev().collect()
}

/// Signed entry point for callers holding an `i128`. Negative magnitudes
/// are rejected with [`EncodeError::InvalidArgument`].
pub fn to_base_signed(number: i128, alphabet: &str) -> Result<String, EncodeError> {
    let magnitude = u128::try_from(number).map_err(|_| {
        EncodeError::InvalidArgument(format!("number must be nonnegative, got {}", number))
    })?;
    to_base(magnitude, alphabet)
}

/// Inverse of [`to_base`].
pub fn from_base(encoded: &str, alphabet: &str) -> Result<u128, EncodeError> {
    let digits = digits(alphabet)?;
    if encoded.is_empty() {
        return Err(EncodeError::InvalidArgument("empty input".to_string()));
    }

    let base = digits.len() as u128;
    let mut n: u128 = 0;
    for c in encoded.chars() {
        let d = digits.iter().position(|&x| x == c).ok_or_else(|| {
            EncodeError::InvalidArgument(format!("{:?} is not a digit of the alphabet", c))
        })?;
        n = n
            .checked_mul(base)
            .and_then(|n| n.checked_add(d as u128))
            .ok_or_else(|| EncodeError::InvalidArgument("value overflows u128".to_string()))?;
    }
    Ok(n)
}

/// Base-36 encoding with [`ALPHABET_36`].
pub fn to36(number: u64) -> String {
    let digits: Vec<char> = ALPHABET_36.chars().collect();
    encode_digits(u128::from(number), &digits)
}

/// Opaque token tying together all log lines of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CorrelationId> for serde_json::Value {
    fn from(id: CorrelationId) -> Self {
        serde_json::Value::String(id.0)
    }
}

/// Generate a correlation ID that is not contained in `exclude`.
///
/// The high 32 bits are the low 32 bits of the current unix time in
/// seconds, the low 32 bits are random, so IDs sort roughly by creation
/// time while uniqueness comes from the random half.
pub fn generate(exclude: &HashSet<CorrelationId>) -> CorrelationId {
    let now = chrono::Utc::now().timestamp();
    generate_at(now, &mut rand::thread_rng(), exclude)
}

/// Same as [`generate`] with an explicit clock reading and random source.
pub fn generate_at<R: Rng + ?Sized>(
    unix_secs: i64,
    rng: &mut R,
    exclude: &HashSet<CorrelationId>,
) -> CorrelationId {
    // Truncation wraps the time component every 2^32 seconds.
    let time_low = (unix_secs as u64) & 0xffff_ffff;
    loop {
        let id = CorrelationId(to36((time_low << 32) | u64::from(rng.gen::<u32>())));
        if !exclude.contains(&id) {
            return id;
        }
    }
}
