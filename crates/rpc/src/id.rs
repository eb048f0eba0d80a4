//! Request id generation.
//!
//! Ids are 64-bit snowflakes: milliseconds since [`EPOCH_MILLIS`] in the high
//! bits, then data center id, machine id and a per-millisecond sequence.

use crate::error::{Error, Result};

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Custom epoch (2024-01-01T00:00:00Z) in milliseconds since the Unix epoch.
pub const EPOCH_MILLIS: u64 = 1_704_067_200_000;

const DATA_CENTER_BITS: u32 = 5;
const MACHINE_BITS: u32 = 5;
const SEQUENCE_BITS: u32 = 12;

/// Largest accepted data center id.
pub const MAX_DATA_CENTER_ID: u64 = (1 << DATA_CENTER_BITS) - 1;
/// Largest accepted machine id.
pub const MAX_MACHINE_ID: u64 = (1 << MACHINE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

const MACHINE_SHIFT: u32 = SEQUENCE_BITS;
const DATA_CENTER_SHIFT: u32 = SEQUENCE_BITS + MACHINE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + MACHINE_BITS + DATA_CENTER_BITS;

#[derive(Debug)]
struct State {
    last_timestamp: u64,
    sequence: u64,
}

/// Thread-safe snowflake id generator.
#[derive(Debug)]
pub struct IdGenerator {
    data_center_id: u64,
    machine_id: u64,
    state: Mutex<State>,
}

impl IdGenerator {
    /// Create a generator for the given node identity.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if either id does not fit its 5-bit field.
    pub fn new(data_center_id: u64, machine_id: u64) -> Result<Self> {
        if data_center_id > MAX_DATA_CENTER_ID || machine_id > MAX_MACHINE_ID {
            return Err(Error::Configuration(format!(
                "data center id {data_center_id} or machine id {machine_id} out of range"
            )));
        }

        Ok(Self {
            data_center_id,
            machine_id,
            state: Mutex::new(State {
                last_timestamp: 0,
                sequence: 0,
            }),
        })
    }

    /// Produce the next id. Ids from one generator are strictly increasing.
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();

        // A clock that went backwards keeps counting from the last timestamp
        let mut timestamp = elapsed_millis().max(state.last_timestamp);

        if timestamp == state.last_timestamp {
            state.sequence += 1;
            if state.sequence > MAX_SEQUENCE {
                timestamp += 1;
                state.sequence = 0;
            }
        } else {
            state.sequence = 0;
        }

        state.last_timestamp = timestamp;

        (timestamp << TIMESTAMP_SHIFT)
            | (self.data_center_id << DATA_CENTER_SHIFT)
            | (self.machine_id << MACHINE_SHIFT)
            | state.sequence
    }
}

/// Split an id into `(timestamp, data_center_id, machine_id, sequence)`.
#[must_use]
pub const fn decompose(id: u64) -> (u64, u64, u64, u64) {
    (
        id >> TIMESTAMP_SHIFT,
        (id >> DATA_CENTER_SHIFT) & MAX_DATA_CENTER_ID,
        (id >> MACHINE_SHIFT) & MAX_MACHINE_ID,
        id & MAX_SEQUENCE,
    )
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
        .saturating_sub(EPOCH_MILLIS)
}
