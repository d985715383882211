use rand::RngCore;

/// PCG128-XSL-RR-64 constants. Fixed so every worker, on every platform,
/// steps the generator identically for a given server seed.
const MULTIPLIER: u128 = 47026247687942121848144207491837523525;
const INCREMENT: u128 = 117397592171526113268558934119004209487;

/// Deterministic random number generator for workflow code.
///
/// The 128-bit state is the server-provided `u64` seed widened, not mixed,
/// so replay reproduces the original sequence exactly. The server replaces
/// the seed on workflow reset via the random-seed update job.
#[derive(Clone, Debug)]
pub struct DeterministicRng {
    state: u128,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: u128::from(seed),
        }
    }

    /// Restart the sequence from a new server seed.
    pub fn reseed(&mut self, seed: u64) {
        self.state = u128::from(seed);
    }

    /// Advance the state and produce the next 64-bit output.
    ///
    /// Output is the xor-folded state rotated right by the state's top six
    /// bits (XSL-RR).
    pub fn next(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(INCREMENT);
        let rot = (self.state >> 122) as u32;
        let xored = ((self.state >> 64) as u64) ^ (self.state as u64);
        xored.rotate_right(rot)
    }

    /// Fill `dst` with deterministic bytes (little-endian output words).
    pub fn fill(&mut self, dst: &mut [u8]) {
        for chunk in dst.chunks_mut(8) {
            let word = self.next().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

impl RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        (self.next() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next()
    }

    fn fill_bytes(&mut self, dst: &mut [u8]) {
        self.fill(dst);
    }
}
