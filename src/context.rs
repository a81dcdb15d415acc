//! Deterministic sources of time and randomness for the engine

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalEncoder;
use crate::error::EncodingError;
use crate::types::Tick;

/// Clock that derives every timestamp from the tick counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicTime {
    epoch: DateTime<Utc>,
    tick_duration_secs: u64,
}

impl DeterministicTime {
    /// Create a new deterministic clock starting at `epoch`
    pub fn new(epoch: DateTime<Utc>, tick_duration_secs: u64) -> Self {
        Self {
            epoch,
            tick_duration_secs,
        }
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    pub fn tick_duration_secs(&self) -> u64 {
        self.tick_duration_secs
    }

    /// Timestamp of a tick, `None` when it falls outside chrono's range
    pub fn at(&self, tick: Tick) -> Option<DateTime<Utc>> {
        let offset = i64::try_from(tick.checked_mul(self.tick_duration_secs)?).ok()?;
        let secs = self.epoch.timestamp().checked_add(offset)?;
        DateTime::from_timestamp(secs, self.epoch.timestamp_subsec_nanos())
    }
}

impl Default for DeterministicTime {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::default(), 1)
    }
}

#[derive(Serialize)]
struct SeedMaterial {
    seed: u64,
    tick: Tick,
}

/// Seeded random number generator for reproducible randomness.
///
/// Each tick draws from a fresh ChaCha8 stream keyed by the SHA-256 of the
/// canonical `{seed, tick}` pair, so the sequence after a restore matches an
/// uninterrupted run without persisting generator state.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    rng: ChaCha8Rng,
    seed: u64,
    tick: Tick,
}

impl SeededRandom {
    /// Create the generator for one tick of one seed
    pub fn for_tick(seed: u64, tick: Tick) -> Result<Self, EncodingError> {
        let key = CanonicalEncoder::new().hash(&SeedMaterial { seed, tick })?;
        Ok(Self {
            rng: ChaCha8Rng::from_seed(key.to_bytes()),
            seed,
            tick,
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Generate a random u64
    pub fn next_u64(&mut self) -> u64 {
        self.rng.gen()
    }

    /// Generate a random value in a range
    pub fn gen_range<T, R>(&mut self, range: R) -> T
    where
        T: rand::distributions::uniform::SampleUniform,
        R: rand::distributions::uniform::SampleRange<T>,
    {
        self.rng.gen_range(range)
    }
}
