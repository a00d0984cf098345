//! Detach key parsing and the escape scanner.

use std::fmt;
use std::str::FromStr;

use berth_common::{BerthError, BerthResult};

/// Ctrl-P.
const CTRL_P: u8 = 0x10;
/// Ctrl-Q.
const CTRL_Q: u8 = 0x11;

/// The byte sequence that ends an attach session without touching the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachKeys(Vec<u8>);

impl DetachKeys {
    /// Create a sequence from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `keys` is empty.
    pub fn new(keys: impl Into<Vec<u8>>) -> BerthResult<Self> {
        let keys = keys.into();
        if keys.is_empty() {
            return Err(BerthError::Config {
                message: "detach key sequence cannot be empty".to_string(),
            });
        }
        Ok(Self(keys))
    }

    /// The raw sequence.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for DetachKeys {
    fn default() -> Self {
        Self(vec![CTRL_P, CTRL_Q])
    }
}

fn parse_key(key: &str) -> Option<u8> {
    if let Some(ctrl) = key.strip_prefix("ctrl-") {
        let [c] = ctrl.as_bytes() else {
            return None;
        };
        return match c {
            b'a'..=b'z' => Some(c - b'a' + 1),
            b'@' => Some(0),
            b'[' => Some(27),
            b'\\' => Some(28),
            b']' => Some(29),
            b'^' => Some(30),
            b'_' => Some(31),
            _ => None,
        };
    }

    match key.as_bytes() {
        [c] if c.is_ascii() => Some(*c),
        _ => None,
    }
}

impl FromStr for DetachKeys {
    type Err = BerthError;

    /// Parse the `ctrl-p,ctrl-q` notation.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let keys = s
            .split(',')
            .map(|key| {
                parse_key(key.trim()).ok_or_else(|| BerthError::Config {
                    message: format!("invalid detach key {key:?} in {s:?}"),
                })
            })
            .collect::<BerthResult<Vec<u8>>>()?;
        Self::new(keys)
    }
}

impl fmt::Display for DetachKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match byte {
                1..=26 => write!(f, "ctrl-{}", char::from(b'a' + byte - 1))?,
                0 => f.write_str("ctrl-@")?,
                27 => f.write_str("ctrl-[")?,
                28 => f.write_str("ctrl-\\")?,
                29 => f.write_str("ctrl-]")?,
                30 => f.write_str("ctrl-^")?,
                31 => f.write_str("ctrl-_")?,
                _ => write!(f, "{}", char::from(*byte))?,
            }
        }
        Ok(())
    }
}

/// Result of feeding a chunk to the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// No detach yet.
    Continue,
    /// The full sequence was seen. Input after it is discarded.
    Detach,
}

/// Finds the detach sequence in a chunked byte stream.
///
/// Bytes that could still be the start of the sequence are held back across
/// reads; they are released once the match breaks or through [`finish`].
///
/// [`finish`]: EscapeScanner::finish
#[derive(Debug, Clone)]
pub struct EscapeScanner {
    keys: DetachKeys,
    held: Vec<u8>,
}

impl EscapeScanner {
    /// Create a scanner for `keys`.
    #[must_use]
    pub fn new(keys: DetachKeys) -> Self {
        let held = Vec::with_capacity(keys.as_bytes().len());
        Self { keys, held }
    }

    /// Scan `chunk`, appending the bytes to forward to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Scan {
        let keys = self.keys.as_bytes();

        for &byte in chunk {
            self.held.push(byte);
            // `held` is always a prefix of `keys`.
            while !keys.starts_with(&self.held) {
                out.push(self.held.remove(0));
            }
            if self.held.len() == keys.len() {
                self.held.clear();
                return Scan::Detach;
            }
        }

        Scan::Continue
    }

    /// Release held bytes at end of input.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.held)
    }

    /// Number of bytes currently held back.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.held.len()
    }
}
