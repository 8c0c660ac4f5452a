use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;

use crate::error::{Result, TableError};

/// Lifecycle of a single seat at a table. `Removed` is terminal: a seat
/// whose occupant was kicked out never becomes available again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeatState {
    Available,
    Occupied(String),
    Removed,
}

/// Mints a seat token unique among `existing`: a URL-safe base64 encoding
/// of `table_id#serial` with a random six-digit serial.
pub fn mint_seat(table_id: &str, existing: &HashMap<String, SeatState>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let serial: u32 = rng.gen_range(0..1_000_000);
        let token = encode_seat(table_id, &format!("{:06}", serial));
        if !existing.contains_key(&token) {
            return token;
        }
    }
}

fn encode_seat(table_id: &str, serial: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}#{}", table_id, serial))
}

/// Decodes a seat token back into `(table_id, serial)`. Any malformed
/// token maps to `InvalidSeat`.
pub fn parse_seat(token: &str) -> Result<(String, String)> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| TableError::InvalidSeat(token.to_string()))?;
    let decoded =
        String::from_utf8(bytes).map_err(|_| TableError::InvalidSeat(token.to_string()))?;
    let (table_id, serial) = decoded
        .rsplit_once('#')
        .ok_or_else(|| TableError::InvalidSeat(token.to_string()))?;
    if table_id.is_empty() || serial.is_empty() {
        return Err(TableError::InvalidSeat(token.to_string()));
    }
    Ok((table_id.to_string(), serial.to_string()))
}
