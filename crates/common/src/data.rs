//! Data pipeline: lexicon, feature files, batching, prefetch.
//!
//! Utterances are pre-extracted spectrograms stored one-per-file in a small
//! binary container; a CSV manifest pairs each feature file with its
//! transcript. Batches pad features to the longest utterance, concatenate
//! label ids, and carry per-sample input/target lengths — the exact shape
//! the CTC criterion consumes.
//!
//! * **[`Lexicon`]** — character symbol table; id 0 is the CTC blank.
//! * **[`FeatureFile`]** / **[`write_feature_file`]** — mmap feature container.
//! * **[`SpeechDataset`]** — manifest-driven dataset with optional masking.
//! * **[`PrefetchLoader`]** — worker threads feeding a bounded channel.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Batches buffered between the producer side and the training thread.
const PREFETCH_BUFFER: usize = 8;

// ── Lexicon ─────────────────────────────────────────────────────────────────

/// Output symbol id reserved for the CTC blank.
pub const BLANK: u32 = 0;

/// Character symbol table. Real symbols occupy ids `1..=len`; id 0 is the
/// blank and never appears in a transcript encoding.
#[derive(Debug, Clone)]
pub struct Lexicon {
    symbols: Vec<char>,
    index: HashMap<char, u32>,
}

impl Lexicon {
    /// Build from an ordered symbol list. Duplicate symbols are an error.
    pub fn from_symbols(symbols: Vec<char>) -> Result<Self> {
        let mut index = HashMap::with_capacity(symbols.len());
        for (i, &c) in symbols.iter().enumerate() {
            if index.insert(c, (i + 1) as u32).is_some() {
                anyhow::bail!("duplicate symbol {c:?} in lexicon");
            }
        }
        Ok(Self { symbols, index })
    }

    /// Load from a JSON file holding an array of single-character strings.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read lexicon {}", path.display()))?;
        let entries: Vec<String> = serde_json::from_str(&json).context("parse lexicon JSON")?;
        let mut symbols = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut chars = entry.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => symbols.push(c),
                _ => anyhow::bail!("lexicon entry {entry:?} is not a single character"),
            }
        }
        Self::from_symbols(symbols)
    }

    /// Number of output classes the model must emit, blank included.
    pub fn num_classes(&self) -> usize {
        self.symbols.len() + 1
    }

    /// Encode a transcript into label ids. Unknown characters are an error.
    pub fn encode(&self, transcript: &str) -> Result<Vec<u32>> {
        transcript
            .chars()
            .map(|c| {
                self.index
                    .get(&c)
                    .copied()
                    .with_context(|| format!("character {c:?} not in lexicon"))
            })
            .collect()
    }

    /// Decode label ids back into a string. Blanks and out-of-range ids are
    /// dropped.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter_map(|&id| {
                if id == BLANK {
                    None
                } else {
                    self.symbols.get(id as usize - 1).copied()
                }
            })
            .collect()
    }
}

// ── Feature file format ─────────────────────────────────────────────────────

/// Magic bytes of the spectrogram container (version 1).
const FEATURE_MAGIC: &[u8; 4] = b"FEA1";
/// Header size: magic (4) + num_frames (8) + feature dim (4).
const FEATURE_HEADER_LEN: usize = 4 + 8 + 4;

/// Write one utterance's features to a binary file for use with
/// [`FeatureFile`].
///
/// Format: magic "FEA1", `num_frames` as u64 LE, `dim` as u32 LE, then
/// `num_frames × dim` f32 LE values in frame-major order.
pub fn write_feature_file(path: &Path, frames: usize, dim: usize, data: &[f32]) -> Result<()> {
    if data.len() != frames * dim {
        anyhow::bail!(
            "feature data length {} does not match {frames} frames × {dim} dim",
            data.len()
        );
    }
    let mut f = File::create(path).context("create feature file")?;
    f.write_all(FEATURE_MAGIC)?;
    f.write_all(&(frames as u64).to_le_bytes())?;
    f.write_all(&(dim as u32).to_le_bytes())?;
    for &v in data {
        f.write_all(&v.to_le_bytes())?;
    }
    f.sync_all().context("sync feature file")?;
    Ok(())
}

/// Memory-mapped view of one utterance's spectrogram. Only the pages
/// touched when the utterance is batched are paged in.
pub struct FeatureFile {
    mmap: Mmap,
    num_frames: usize,
    dim: usize,
}

impl FeatureFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("open feature file {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).context("mmap feature file")? };
        if mmap.len() < FEATURE_HEADER_LEN {
            anyhow::bail!("feature file too short: {}", path.display());
        }
        if &mmap[0..4] != FEATURE_MAGIC {
            anyhow::bail!("invalid feature file (bad magic): {}", path.display());
        }
        let num_frames = u64::from_le_bytes(mmap[4..12].try_into().unwrap()) as usize;
        let dim = u32::from_le_bytes(mmap[12..16].try_into().unwrap()) as usize;
        let expected = FEATURE_HEADER_LEN + num_frames * dim * 4;
        if mmap.len() < expected {
            anyhow::bail!(
                "feature file truncated: expected {expected} bytes, got {}",
                mmap.len()
            );
        }
        Ok(Self {
            mmap,
            num_frames,
            dim,
        })
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Copy the full frame-major feature matrix out of the mmap.
    pub fn to_vec(&self) -> Vec<f32> {
        let n = self.num_frames * self.dim;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let at = FEATURE_HEADER_LEN + i * 4;
            out.push(f32::from_le_bytes(self.mmap[at..at + 4].try_into().unwrap()));
        }
        out
    }
}

// ── Batch ───────────────────────────────────────────────────────────────────

/// One training/evaluation batch.
///
/// `features` is `(batch, max_frames, dim)` row-major, zero-padded past each
/// sample's `input_lengths`. `labels` holds every sample's target ids
/// back-to-back; `target_lengths` delimits them.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: Vec<f32>,
    pub batch_size: usize,
    pub max_frames: usize,
    pub feat_dim: usize,
    pub labels: Vec<u32>,
    pub input_lengths: Vec<usize>,
    pub target_lengths: Vec<usize>,
}

impl Batch {
    /// Upload the padded feature block as a `(batch, max_frames, dim)` tensor.
    pub fn features_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_vec(
            self.features.clone(),
            (self.batch_size, self.max_frames, self.feat_dim),
            device,
        )
    }

    /// Label ids of sample `b` as a slice into the concatenated labels.
    pub fn labels_for(&self, b: usize) -> &[u32] {
        let start: usize = self.target_lengths[..b].iter().sum();
        &self.labels[start..start + self.target_lengths[b]]
    }
}

/// Anything that yields batches in a fixed order, one epoch per call.
pub trait BatchSource {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Batch> + '_>;
}

// ── SpeechDataset ───────────────────────────────────────────────────────────

struct Utterance {
    feature_path: PathBuf,
    labels: Vec<u32>,
}

/// Manifest-driven dataset over pre-extracted features.
///
/// The manifest is CSV with one `feature_path,transcript` row per utterance
/// (the transcript may itself contain commas). Relative feature paths
/// resolve against the manifest's directory. Transcripts are encoded
/// through the lexicon at load time so malformed rows fail before training
/// starts, not mid-epoch.
pub struct SpeechDataset {
    utterances: Vec<Utterance>,
    feat_dim: usize,
    augment: bool,
    seed: u64,
}

impl SpeechDataset {
    pub fn new(manifest: &Path, lexicon: &Lexicon, augment: bool, seed: u64) -> Result<Self> {
        let text = std::fs::read_to_string(manifest)
            .with_context(|| format!("read manifest {}", manifest.display()))?;
        let base = manifest.parent().unwrap_or_else(|| Path::new("."));

        let mut utterances = Vec::new();
        let mut feat_dim = 0usize;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (path_part, transcript) = line
                .split_once(',')
                .with_context(|| format!("manifest line {}: missing comma", lineno + 1))?;
            let feature_path = base.join(path_part.trim());
            let labels = lexicon
                .encode(transcript)
                .with_context(|| format!("manifest line {}", lineno + 1))?;
            // Header probe: reject unreadable files and mixed feature dims up
            // front.
            let ff = FeatureFile::open(&feature_path)?;
            if feat_dim == 0 {
                feat_dim = ff.dim();
            } else if ff.dim() != feat_dim {
                anyhow::bail!(
                    "feature dim mismatch in {}: {} != {}",
                    feature_path.display(),
                    ff.dim(),
                    feat_dim
                );
            }
            utterances.push(Utterance {
                feature_path,
                labels,
            });
        }
        if utterances.is_empty() {
            anyhow::bail!("manifest {} holds no utterances", manifest.display());
        }
        Ok(Self {
            utterances,
            feat_dim,
            augment,
            seed,
        })
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        (self.utterances.len() + batch_size - 1) / batch_size
    }

    /// Build batch `index` of an epoch. Deterministic for a given dataset
    /// seed and index, so worker threads can build batches out of order and
    /// still produce identical contents.
    pub fn batch_at(&self, index: usize, batch_size: usize) -> Result<Option<Batch>> {
        let start = index * batch_size;
        if start >= self.utterances.len() {
            return Ok(None);
        }
        let end = (start + batch_size).min(self.utterances.len());
        let utts = &self.utterances[start..end];

        let mut mats = Vec::with_capacity(utts.len());
        let mut max_frames = 0usize;
        for utt in utts {
            let ff = FeatureFile::open(&utt.feature_path)?;
            let mut mat = ff.to_vec();
            let frames = ff.num_frames();
            if self.augment {
                let mut rng = StdRng::seed_from_u64(self.seed ^ (index as u64).rotate_left(17));
                mask_features(&mut mat, frames, self.feat_dim, &mut rng);
            }
            max_frames = max_frames.max(frames);
            mats.push((mat, frames));
        }

        let b = utts.len();
        let mut features = vec![0f32; b * max_frames * self.feat_dim];
        let mut input_lengths = Vec::with_capacity(b);
        for (i, (mat, frames)) in mats.iter().enumerate() {
            let dst = i * max_frames * self.feat_dim;
            features[dst..dst + mat.len()].copy_from_slice(mat);
            input_lengths.push(*frames);
        }

        let mut labels = Vec::new();
        let mut target_lengths = Vec::with_capacity(b);
        for utt in utts {
            labels.extend_from_slice(&utt.labels);
            target_lengths.push(utt.labels.len());
        }

        Ok(Some(Batch {
            features,
            batch_size: b,
            max_frames,
            feat_dim: self.feat_dim,
            labels,
            input_lengths,
            target_lengths,
        }))
    }

    /// Yield every batch of one epoch in manifest order.
    pub fn epoch_batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        let mut index = 0usize;
        std::iter::from_fn(move || {
            let batch = self.batch_at(index, batch_size).ok().flatten()?;
            index += 1;
            Some(batch)
        })
    }
}

/// In-memory batch source over a dataset, used for evaluation subsamples
/// and tests.
pub struct DatasetSource {
    dataset: Arc<SpeechDataset>,
    batch_size: usize,
}

impl DatasetSource {
    pub fn new(dataset: Arc<SpeechDataset>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size,
        }
    }
}

impl BatchSource for DatasetSource {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Batch> + '_> {
        Box::new(self.dataset.epoch_batches(self.batch_size))
    }
}

// ── Augmentation ────────────────────────────────────────────────────────────

/// SpecAugment-style masking: up to two time spans and two frequency bands
/// zeroed in place. Span widths cap at a tenth of each axis.
fn mask_features(mat: &mut [f32], frames: usize, dim: usize, rng: &mut StdRng) {
    for _ in 0..2 {
        let max_t = (frames / 10).max(1);
        let width = rng.gen_range(0..=max_t);
        if width > 0 && frames > width {
            let start = rng.gen_range(0..frames - width);
            for t in start..start + width {
                mat[t * dim..(t + 1) * dim].fill(0.0);
            }
        }
        let max_f = (dim / 10).max(1);
        let band = rng.gen_range(0..=max_f);
        if band > 0 && dim > band {
            let start = rng.gen_range(0..dim - band);
            for t in 0..frames {
                mat[t * dim + start..t * dim + start + band].fill(0.0);
            }
        }
    }
}

// ── PrefetchLoader ──────────────────────────────────────────────────────────

/// Bounded producer/consumer loader.
///
/// `num_workers` threads build batches concurrently; a collector restores
/// manifest order before handing them to the training thread through a
/// channel holding at most [`PREFETCH_BUFFER`] batches. Dropping the epoch
/// iterator tears the pipeline down: sends fail and the threads exit.
pub struct PrefetchLoader {
    dataset: Arc<SpeechDataset>,
    batch_size: usize,
    num_workers: usize,
}

impl PrefetchLoader {
    pub fn new(dataset: Arc<SpeechDataset>, batch_size: usize, num_workers: usize) -> Self {
        Self {
            dataset,
            batch_size,
            num_workers: num_workers.max(1),
        }
    }

    /// Spawn one epoch's worth of producers and return the ordered stream.
    fn stream_epoch(&self) -> mpsc::IntoIter<Batch> {
        let num_batches = self.dataset.num_batches(self.batch_size);
        let (out_tx, out_rx) = mpsc::sync_channel::<Batch>(PREFETCH_BUFFER);
        let (built_tx, built_rx) = mpsc::sync_channel::<(usize, Batch)>(self.num_workers * 2);
        let next_index = Arc::new(AtomicUsize::new(0));

        for _ in 0..self.num_workers {
            let dataset = Arc::clone(&self.dataset);
            let built_tx = built_tx.clone();
            let next_index = Arc::clone(&next_index);
            let batch_size = self.batch_size;
            thread::spawn(move || loop {
                let index = next_index.fetch_add(1, Ordering::Relaxed);
                if index >= num_batches {
                    return;
                }
                match dataset.batch_at(index, batch_size) {
                    Ok(Some(batch)) => {
                        if built_tx.send((index, batch)).is_err() {
                            return;
                        }
                    }
                    _ => return,
                }
            });
        }
        drop(built_tx);

        // Collector: restore manifest order before the bounded hand-off.
        thread::spawn(move || {
            let mut pending: BTreeMap<usize, Batch> = BTreeMap::new();
            let mut expected = 0usize;
            for (index, batch) in built_rx {
                pending.insert(index, batch);
                while let Some(batch) = pending.remove(&expected) {
                    if out_tx.send(batch).is_err() {
                        return;
                    }
                    expected += 1;
                }
            }
        });

        out_rx.into_iter()
    }
}

impl BatchSource for PrefetchLoader {
    fn batches(&mut self) -> Box<dyn Iterator<Item = Batch> + '_> {
        Box::new(self.stream_epoch())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_lexicon() -> Lexicon {
        Lexicon::from_symbols(vec!['a', 'b', 'c', ' ']).unwrap()
    }

    fn write_dataset(dir: &Path, utts: &[(usize, &str)]) -> PathBuf {
        let mut manifest = String::new();
        for (i, (frames, transcript)) in utts.iter().enumerate() {
            let name = format!("utt{i}.fea");
            let data: Vec<f32> = (0..frames * 3).map(|v| v as f32 * 0.5).collect();
            write_feature_file(&dir.join(&name), *frames, 3, &data).unwrap();
            manifest.push_str(&format!("{name},{transcript}\n"));
        }
        let path = dir.join("train.csv");
        std::fs::write(&path, manifest).unwrap();
        path
    }

    #[test]
    fn lexicon_encode_decode_round_trip() {
        let lex = test_lexicon();
        let ids = lex.encode("ab cab").unwrap();
        assert_eq!(ids, vec![1, 2, 4, 3, 1, 2]);
        assert_eq!(lex.decode(&ids), "ab cab");
        assert_eq!(lex.num_classes(), 5);
    }

    #[test]
    fn lexicon_rejects_unknown_character() {
        let lex = test_lexicon();
        assert!(lex.encode("xyz").is_err());
    }

    #[test]
    fn feature_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.fea");
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        write_feature_file(&path, 4, 3, &data).unwrap();
        let ff = FeatureFile::open(&path).unwrap();
        assert_eq!(ff.num_frames(), 4);
        assert_eq!(ff.dim(), 3);
        assert_eq!(ff.to_vec(), data);
    }

    #[test]
    fn feature_file_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.fea");
        std::fs::write(&path, b"NOPE0000000000000000").unwrap();
        assert!(FeatureFile::open(&path).is_err());
    }

    #[test]
    fn batches_pad_and_concatenate() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_dataset(dir.path(), &[(5, "ab"), (3, "c")]);
        let ds = SpeechDataset::new(&manifest, &test_lexicon(), false, 0).unwrap();
        assert_eq!(ds.len(), 2);

        let batch = ds.batch_at(0, 2).unwrap().unwrap();
        assert_eq!(batch.batch_size, 2);
        assert_eq!(batch.max_frames, 5);
        assert_eq!(batch.input_lengths, vec![5, 3]);
        assert_eq!(batch.target_lengths, vec![2, 1]);
        assert_eq!(batch.labels, vec![1, 2, 3]);
        assert_eq!(batch.labels_for(1), &[3]);
        // Second sample is padded with zeros past frame 3.
        let dim = batch.feat_dim;
        let pad_start = (batch.max_frames * dim) + 3 * dim;
        assert!(batch.features[pad_start..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn epoch_batches_cover_dataset_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_dataset(dir.path(), &[(4, "a"), (4, "b"), (4, "c")]);
        let ds = SpeechDataset::new(&manifest, &test_lexicon(), false, 0).unwrap();
        let batches: Vec<Batch> = ds.epoch_batches(2).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].batch_size, 2);
        assert_eq!(batches[1].batch_size, 1);
        assert_eq!(batches[1].labels, vec![3]);
    }

    #[test]
    fn augmentation_is_deterministic_per_batch_index() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_dataset(dir.path(), &[(40, "ab")]);
        let ds = SpeechDataset::new(&manifest, &test_lexicon(), true, 7).unwrap();
        let a = ds.batch_at(0, 1).unwrap().unwrap();
        let b = ds.batch_at(0, 1).unwrap().unwrap();
        assert_eq!(a.features, b.features);
    }

    #[test]
    fn prefetch_matches_direct_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_dataset(dir.path(), &[(4, "a"), (5, "b"), (6, "c"), (7, "ab")]);
        let ds = Arc::new(SpeechDataset::new(&manifest, &test_lexicon(), false, 0).unwrap());

        let direct: Vec<Batch> = ds.epoch_batches(2).collect();
        let mut loader = PrefetchLoader::new(Arc::clone(&ds), 2, 3);
        let prefetched: Vec<Batch> = loader.batches().collect();

        assert_eq!(direct.len(), prefetched.len());
        for (d, p) in direct.iter().zip(&prefetched) {
            assert_eq!(d.features, p.features);
            assert_eq!(d.labels, p.labels);
            assert_eq!(d.input_lengths, p.input_lengths);
        }
    }
}
