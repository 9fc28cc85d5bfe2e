use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

/// Keys shorter than this collide too often for tests that assert every
/// inserted entry is retrievable.
const MIN_BYTES_FOR_VAR_KEY: usize = 5;

pub(crate) fn common_setup() {
    // Try init since multiple tests calling `init` will cause an error.
    let _ = pretty_env_logger::try_init();
}

/// `n` seeded entries with 32-byte keys, the shape account tries have.
pub(crate) fn fixed_key_entries(n: usize, seed: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut rng = StdRng::seed_from_u64(seed);

    (0..n)
        .map(|_| {
            let mut key = vec![0; 32];
            rng.fill_bytes(&mut key);
            (key, rand_value(&mut rng))
        })
        .collect()
}

/// `n` seeded entries with variable-length keys, deduplicated so every key
/// maps to exactly one value.
pub(crate) fn variable_key_entries(n: usize, seed: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut seen = std::collections::HashSet::new();

    let mut entries = Vec::with_capacity(n);
    while entries.len() < n {
        let len = rng.gen_range(MIN_BYTES_FOR_VAR_KEY..=32);
        let mut key = vec![0; len];
        rng.fill_bytes(&mut key);

        if seen.insert(key.clone()) {
            let value = rand_value(&mut rng);
            entries.push((key, value));
        }
    }

    entries
}

/// A value long enough that its leaf always crosses the hashing threshold.
pub(crate) fn large_value(tag: u8) -> Vec<u8> {
    let mut value = vec![tag];
    value.extend(std::iter::repeat(0xff).take(32));
    value
}

fn rand_value(rng: &mut StdRng) -> Vec<u8> {
    let mut value = vec![0; 32];
    rng.fill_bytes(&mut value);
    value
}
