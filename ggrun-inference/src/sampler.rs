use crate::layers::softmax;

#[cfg(test)]
#[path = "../tests/unit/sampler_test.rs"]
mod sampler_test;

/// Replaces a zero seed, which would leave xorshift stuck at zero forever.
const ZERO_SEED_REPLACEMENT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Xorshift* generator owned by a session, so sampling is reproducible per seed.
#[derive(Clone, Debug)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self { state: if seed == 0 { ZERO_SEED_REPLACEMENT } else { seed } }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        (self.state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u32
    }

    /// Uniform float in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16_777_216.0
    }
}

/// Which selection rule a sampler applies after softmax.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplingPolicy {
    /// Temperature below 0.01: argmax.
    Greedy,
    /// `0 < top_p < 1`: draw from the smallest prefix of sorted probabilities reaching `top_p`.
    Nucleus,
    /// Anything else: argmax over the temperature-scaled distribution.
    Standard,
}

/// Stores a probability and its associated index (token id).
#[derive(Clone, Copy, Debug)]
pub struct ProbIndex {
    pub prob: f32,
    pub index: usize,
}

/// Token picked by [`Sampler::sample`] and its post-softmax probability.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sampled {
    pub token: usize,
    pub prob: f32,
}

/// Temperature / top-p sampler over a logits buffer.
///
/// The logits slice is rewritten in place into probabilities.
#[derive(Debug)]
pub struct Sampler {
    probindex: Vec<ProbIndex>,
    temperature: f32,
    top_p: f32,
}

impl Sampler {
    pub fn new(vocab_size: usize, temperature: f32, top_p: f32) -> Self {
        Self {
            probindex: Vec::with_capacity(vocab_size),
            temperature: temperature.max(0.0),
            top_p,
        }
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    pub fn policy(&self) -> SamplingPolicy {
        if self.temperature < 0.01 {
            SamplingPolicy::Greedy
        } else if self.top_p > 0.0 && self.top_p < 1.0 {
            SamplingPolicy::Nucleus
        } else {
            SamplingPolicy::Standard
        }
    }

    /// Picks the next token.
    ///
    /// - Logits are divided by the temperature unless it is 0 or within 0.001 of 1.
    /// - Softmax turns them into probabilities.
    /// - The policy selects a token; only nucleus sampling consumes randomness.
    ///
    /// Returns `None` for an empty buffer.
    pub fn sample(&mut self, logits: &mut [f32], rng: &mut Rng) -> Option<Sampled> {
        if logits.is_empty() {
            return None;
        }

        if self.temperature > 0.0 && (self.temperature - 1.0).abs() > 0.001 {
            let inv = 1.0 / self.temperature;
            logits.iter_mut().for_each(|logit| *logit *= inv);
        }
        softmax(logits);

        let token = match self.policy() {
            SamplingPolicy::Greedy | SamplingPolicy::Standard => argmax(logits),
            SamplingPolicy::Nucleus => {
                let coin = rng.next_f32();
                self.sample_top_p(logits, coin)
            }
        };

        Some(Sampled { token, prob: logits[token] })
    }

    fn sample_top_p(&mut self, probs: &[f32], coin: f32) -> usize {
        self.probindex.clear();
        self.probindex.extend(probs.iter().enumerate().map(|(index, &prob)| ProbIndex { prob, index }));
        // Stable: equal probabilities keep ascending token order.
        self.probindex.sort_by(|a, b| b.prob.total_cmp(&a.prob));

        let mut cumulative = 0.0;
        let mut last = self.probindex.len() - 1;
        for (i, entry) in self.probindex.iter().enumerate() {
            cumulative += entry.prob;
            if cumulative >= self.top_p {
                last = i;
                break;
            }
        }

        let r = coin * cumulative;
        let mut cdf = 0.0;
        for entry in &self.probindex[..=last] {
            cdf += entry.prob;
            if cdf >= r {
                return entry.index;
            }
        }
        // rounding left the cdf short of `r`
        self.probindex[last].index
    }
}

/// Index of the largest value; ties resolve to the lowest index.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &value) in values.iter().enumerate().skip(1) {
        if value > values[best] {
            best = i;
        }
    }
    best
}
