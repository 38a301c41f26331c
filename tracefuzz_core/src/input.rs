use crate::execution_index::ExecutionIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::RngCore;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Maximum number of bytes an [`IndexedInput`] hands out before reporting end
/// of stream.
pub const MAX_INPUT_SIZE: usize = 1024;

/// An endless stream of pseudorandom bytes.
pub struct RandomByteStream {
    rng: ChaCha8Rng,
}

impl RandomByteStream {
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self { rng }
    }
}

impl Read for RandomByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rng.fill_bytes(buf);
        Ok(buf.len())
    }
}

/// Wraps a reader and keeps a copy of every byte read through it, so that a
/// trial's consumed input can be replayed or hashed afterwards.
pub struct RecordingReader<'a> {
    inner: &'a mut dyn Read,
    recorded: Vec<u8>,
}

impl<'a> RecordingReader<'a> {
    pub fn new(inner: &'a mut dyn Read) -> Self {
        Self {
            inner,
            recorded: Vec::new(),
        }
    }

    pub fn recorded(&self) -> &[u8] {
        &self.recorded
    }

    pub fn into_recorded(self) -> Vec<u8> {
        self.recorded
    }
}

impl Read for RecordingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.recorded.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

#[derive(Debug, Clone)]
struct SeedSource {
    path: PathBuf,
    bytes: Vec<u8>,
    position: usize,
}

/// An input represented as a map from execution index to byte value.
///
/// Bytes are looked up by the execution index of the read that requests them,
/// so a mutated input keeps supplying the same value to the same structural
/// read even when earlier reads change how much data is consumed.
#[derive(Debug, Clone, Default)]
pub struct IndexedInput {
    values: BTreeMap<ExecutionIndex, u8>,
    /// Keys requested during the last execution, in request order.
    required_keys: Vec<ExecutionIndex>,
    favoured: bool,
    seed: Option<SeedSource>,
}

impl IndexedInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// An input whose values are read sequentially from the bytes of a seed
    /// file, keyed by whatever execution index requests them.
    pub fn from_seed(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            seed: Some(SeedSource {
                path: path.into(),
                bytes,
                position: 0,
            }),
            ..Self::default()
        }
    }

    /// Child input sharing this input's values. Required keys and favoured
    /// status are not inherited.
    pub fn child(&self) -> Self {
        Self {
            values: self.values.clone(),
            ..Self::default()
        }
    }

    /// Returns the byte stored under `key`, drawing and remembering a fresh
    /// one if absent. `None` signals end of stream: the seed is exhausted or
    /// the input reached [`MAX_INPUT_SIZE`].
    pub fn get_or_generate_fresh<R: Rng + ?Sized>(
        &mut self,
        key: ExecutionIndex,
        rng: &mut R,
    ) -> Option<u8> {
        if let Some(seed) = self.seed.as_mut() {
            let value = *seed.bytes.get(seed.position)?;
            seed.position += 1;
            self.values.insert(key.clone(), value);
            self.required_keys.push(key);
            return Some(value);
        }
        if self.required_keys.len() >= MAX_INPUT_SIZE {
            return None;
        }
        let value = *self.values.entry(key.clone()).or_insert_with(|| rng.random());
        self.required_keys.push(key);
        Some(value)
    }

    /// Drops values that the last execution never asked for.
    pub fn gc(&mut self) {
        let mut kept = BTreeMap::new();
        for key in &self.required_keys {
            if let Some(value) = self.values.get(key) {
                kept.insert(key.clone(), *value);
            }
        }
        self.values = kept;
        self.seed = None;
    }

    /// The bytes handed out during the last execution, in request order.
    pub fn consumed_bytes(&self) -> Vec<u8> {
        self.required_keys
            .iter()
            .filter_map(|key| self.values.get(key).copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn required_keys(&self) -> &[ExecutionIndex] {
        &self.required_keys
    }

    pub fn is_favoured(&self) -> bool {
        self.favoured
    }

    pub fn set_favoured(&mut self, favoured: bool) {
        self.favoured = favoured;
    }

    pub fn seed_path(&self) -> Option<&Path> {
        self.seed.as_ref().map(|seed| seed.path.as_path())
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut u8> {
        self.values.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::SeedableRng;
    use std::io::Cursor;

    fn key(site: i32) -> ExecutionIndex {
        ExecutionIndex::new(vec![site, 1]).unwrap()
    }

    #[test]
    fn random_stream_is_deterministic_per_seed() {
        let mut a = RandomByteStream::new(ChaCha8Rng::seed_from_u64(7));
        let mut b = RandomByteStream::new(ChaCha8Rng::seed_from_u64(7));
        let (mut buf_a, mut buf_b) = ([0u8; 32], [0u8; 32]);
        a.read_exact(&mut buf_a).unwrap();
        b.read_exact(&mut buf_b).unwrap();
        assert_eq!(buf_a, buf_b);
    }

    #[test]
    fn recording_reader_keeps_consumed_bytes() {
        let mut source = Cursor::new(vec![1u8, 2, 3, 4]);
        let mut recorder = RecordingReader::new(&mut source);
        let mut buf = [0u8; 3];
        recorder.read_exact(&mut buf).unwrap();
        assert_eq!(recorder.recorded(), &[1, 2, 3]);
    }

    #[test]
    fn fresh_values_are_remembered_per_key() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut input = IndexedInput::new();
        let first = input.get_or_generate_fresh(key(1), &mut rng);
        let again = input.get_or_generate_fresh(key(1), &mut rng);
        assert_eq!(first, again);
        assert_eq!(input.len(), 1);
        assert_eq!(input.required_keys().len(), 2);
    }

    #[test]
    fn input_size_is_capped() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut input = IndexedInput::new();
        for i in 0..MAX_INPUT_SIZE as i32 {
            assert!(input.get_or_generate_fresh(key(i), &mut rng).is_some());
        }
        assert_eq!(input.get_or_generate_fresh(key(-1), &mut rng), None);
    }

    #[test]
    fn seed_values_come_from_the_file_then_end() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut input = IndexedInput::from_seed("seed", vec![10, 20]);
        assert_eq!(input.get_or_generate_fresh(key(1), &mut rng), Some(10));
        assert_eq!(input.get_or_generate_fresh(key(2), &mut rng), Some(20));
        assert_eq!(input.get_or_generate_fresh(key(3), &mut rng), None);
        assert_eq!(input.consumed_bytes(), vec![10, 20]);
        input.gc();
        assert!(input.seed_path().is_none());
        assert_eq!(input.len(), 2);
    }

    #[test]
    fn gc_keeps_only_required_keys() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut parent = IndexedInput::new();
        parent.get_or_generate_fresh(key(1), &mut rng);
        parent.get_or_generate_fresh(key(2), &mut rng);

        let mut child = parent.child();
        assert!(child.required_keys().is_empty());
        child.get_or_generate_fresh(key(2), &mut rng);
        child.gc();
        assert_eq!(child.len(), 1);
        assert_eq!(child.consumed_bytes(), parent.consumed_bytes()[1..].to_vec());
    }
}
