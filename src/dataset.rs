use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::PipelineError;

/// Words shorter or longer than this (in chars) are dropped before splitting.
pub const MAX_WORD_CHARS: usize = 50;

pub type Dictionary = BTreeMap<String, String>;

/// One training pair: language tag, written word, space-delimited phonemes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub lang: String,
    pub word: String,
    pub phonemes: String,
}

impl Sample {
    pub fn ja(word: impl Into<String>, phonemes: impl Into<String>) -> Self {
        Self {
            lang: "ja".to_string(),
            word: word.into(),
            phonemes: phonemes.into(),
        }
    }
}

/// Collapse runs of whitespace to single spaces and trim the ends.
/// Tone and length markers are kept intentionally. Idempotent.
pub fn normalize_phonemes(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Load the word -> phoneme dictionary, merging an optional lexicon on top.
/// Lexicon entries override dictionary entries on key collision.
pub fn load_dictionary(
    dictionary_path: &Path,
    lexicon_path: Option<&Path>,
) -> crate::Result<Dictionary> {
    let mut dict = read_json_map(dictionary_path)?;

    if let Some(lexicon_path) = lexicon_path {
        let lexicon = read_json_map(lexicon_path)?;
        dict.extend(lexicon);
    }

    if dict.is_empty() {
        return Err(PipelineError::Data(format!(
            "dictionary is empty after merging: {}",
            dictionary_path.display()
        )));
    }

    Ok(dict)
}

fn read_json_map(path: &Path) -> crate::Result<Dictionary> {
    let content = fs::read_to_string(path).map_err(|e| {
        PipelineError::Data(format!("cannot read dictionary {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        PipelineError::Data(format!(
            "dictionary {} is not a valid JSON object of word -> phoneme pairs: {e}",
            path.display()
        ))
    })
}

/// Turn dictionary entries into samples, normalizing phonemes and dropping
/// words whose char length is 0 or exceeds [`MAX_WORD_CHARS`].
pub fn samples_from_dictionary(dict: &Dictionary) -> Vec<Sample> {
    dict.iter()
        .filter(|(word, _)| {
            let len = word.chars().count();
            len >= 1 && len <= MAX_WORD_CHARS
        })
        .map(|(word, phonemes)| Sample::ja(word.clone(), normalize_phonemes(phonemes)))
        .collect()
}

/// Shuffle with a fixed seed and partition: the first `floor(n * train_ratio)`
/// samples go to train, the next `floor(n * val_ratio)` to validation, the
/// remainder to test. Empty input yields three empty splits.
pub fn split_samples(
    mut samples: Vec<Sample>,
    train_ratio: f32,
    val_ratio: f32,
    seed: u64,
) -> crate::Result<(Vec<Sample>, Vec<Sample>, Vec<Sample>)> {
    if train_ratio < 0.0 || val_ratio < 0.0 || train_ratio + val_ratio > 1.0 {
        return Err(PipelineError::Config(format!(
            "invalid split ratios: train={train_ratio} val={val_ratio}"
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    samples.shuffle(&mut rng);

    let n = samples.len();
    let n_train = ((n as f32) * train_ratio).floor() as usize;
    let n_val = ((n as f32) * val_ratio).floor() as usize;

    let test = samples.split_off(n_train + n_val);
    let val = samples.split_off(n_train);
    Ok((samples, val, test))
}

/// Expand samples with synthetic variants, preserving every original:
/// a lowercased word when lowercasing changes it, and for unspaced words
/// longer than 4 chars a copy with a single space at the midpoint char.
///
/// The midpoint split is a word-boundary heuristic, not a phonetically
/// validated segmentation; callers are expected to warn when enabling it.
pub fn augment_samples(samples: &[Sample]) -> Vec<Sample> {
    let mut augmented = Vec::with_capacity(samples.len());

    for sample in samples {
        augmented.push(sample.clone());

        let lowered = sample.word.to_lowercase();
        if lowered != sample.word {
            augmented.push(Sample {
                lang: sample.lang.clone(),
                word: lowered,
                phonemes: sample.phonemes.clone(),
            });
        }

        let chars: Vec<char> = sample.word.chars().collect();
        if !sample.word.contains(' ') && chars.len() > 4 {
            let mid = chars.len() / 2;
            let mut spaced = String::with_capacity(sample.word.len() + 1);
            spaced.extend(&chars[..mid]);
            spaced.push(' ');
            spaced.extend(&chars[mid..]);
            augmented.push(Sample {
                lang: sample.lang.clone(),
                word: spaced,
                phonemes: sample.phonemes.clone(),
            });
        }
    }

    augmented
}

/// Write one split as `lang\tword\tphonemes` lines, no header.
pub fn write_split_file(path: &Path, samples: &[Sample]) -> crate::Result<()> {
    let mut content = String::new();
    for sample in samples {
        content.push_str(&sample.lang);
        content.push('\t');
        content.push_str(&sample.word);
        content.push('\t');
        content.push_str(&sample.phonemes);
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}

/// Aggregate numbers shown by the dashboard after a dictionary upload.
#[derive(Clone, Debug)]
pub struct DictionaryStats {
    pub entries: usize,
    pub filtered: usize,
    pub unique_chars: usize,
    pub unique_phonemes: usize,
    pub max_word_chars: usize,
    pub max_phoneme_tokens: usize,
}

pub fn dictionary_stats(dict: &Dictionary) -> DictionaryStats {
    let samples = samples_from_dictionary(dict);
    let mut chars = BTreeSet::new();
    let mut phonemes = BTreeSet::new();
    let mut max_word_chars = 0;
    let mut max_phoneme_tokens = 0;

    for sample in &samples {
        max_word_chars = max_word_chars.max(sample.word.chars().count());
        max_phoneme_tokens = max_phoneme_tokens.max(sample.phonemes.split(' ').count());
        chars.extend(sample.word.chars());
        phonemes.extend(sample.phonemes.split(' ').map(str::to_string));
    }

    DictionaryStats {
        entries: dict.len(),
        filtered: samples.len(),
        unique_chars: chars.len(),
        unique_phonemes: phonemes.len(),
        max_word_chars,
        max_phoneme_tokens,
    }
}

/// Symbol tables sizing the model: distinct chars and phoneme tokens each map
/// to ids starting at 1, with 0 reserved for padding. `seq_len` is the shared
/// padded length for both inputs and targets.
#[derive(Clone, Debug)]
pub struct Vocabulary {
    char_to_id: BTreeMap<char, u32>,
    phoneme_to_id: BTreeMap<String, u32>,
    pub seq_len: usize,
}

pub const PAD_ID: u32 = 0;

impl Vocabulary {
    /// Build over every sample the encoder will see. Augmented variants must
    /// be included so the inserted space is a known symbol.
    pub fn build(sample_sets: &[&[Sample]]) -> Self {
        let mut chars = BTreeSet::new();
        let mut phonemes = BTreeSet::new();
        let mut seq_len = 0;

        for samples in sample_sets {
            for sample in *samples {
                seq_len = seq_len
                    .max(sample.word.chars().count())
                    .max(sample.phonemes.split(' ').count());
                chars.extend(sample.word.chars());
                phonemes.extend(sample.phonemes.split(' ').map(str::to_string));
            }
        }

        let char_to_id = chars
            .into_iter()
            .enumerate()
            .map(|(idx, c)| (c, idx as u32 + 1))
            .collect();
        let phoneme_to_id = phonemes
            .into_iter()
            .enumerate()
            .map(|(idx, p)| (p, idx as u32 + 1))
            .collect();

        Self {
            char_to_id,
            phoneme_to_id,
            seq_len,
        }
    }

    /// Input embedding table size, padding included.
    pub fn vocab_size(&self) -> usize {
        self.char_to_id.len() + 1
    }

    /// Output projection size, padding included.
    pub fn phoneme_size(&self) -> usize {
        self.phoneme_to_id.len() + 1
    }

    pub fn encode_word(&self, word: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = word
            .chars()
            .take(self.seq_len)
            .map(|c| match self.char_to_id.get(&c) {
                Some(&id) => id,
                None => {
                    eprintln!("Warning: unknown character '{c}' encoded as padding");
                    PAD_ID
                }
            })
            .collect();
        ids.resize(self.seq_len, PAD_ID);
        ids
    }

    pub fn encode_phonemes(&self, phonemes: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = phonemes
            .split(' ')
            .filter(|t| !t.is_empty())
            .take(self.seq_len)
            .map(|t| match self.phoneme_to_id.get(t) {
                Some(&id) => id,
                None => {
                    eprintln!("Warning: unknown phoneme '{t}' encoded as padding");
                    PAD_ID
                }
            })
            .collect();
        ids.resize(self.seq_len, PAD_ID);
        ids
    }
}

/// Padded integer-encoded arrays handed to the trainer.
#[derive(Clone, Debug)]
pub struct EncodedDataset {
    pub inputs: Vec<Vec<u32>>,
    pub targets: Vec<Vec<u32>>,
}

impl EncodedDataset {
    pub fn encode(vocab: &Vocabulary, samples: &[Sample]) -> Self {
        let inputs = samples.iter().map(|s| vocab.encode_word(&s.word)).collect();
        let targets = samples
            .iter()
            .map(|s| vocab.encode_phonemes(&s.phonemes))
            .collect();
        Self { inputs, targets }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: &[(&str, &str)]) -> Dictionary {
        entries
            .iter()
            .map(|(w, p)| (w.to_string(), p.to_string()))
            .collect()
    }

    #[test]
    fn normalize_collapses_and_trims() {
        assert_eq!(normalize_phonemes("  a  r i\tg a\n"), "a r i g a");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_phonemes("  o  h a   y o u ");
        assert_eq!(normalize_phonemes(&once), once);
    }

    #[test]
    fn normalize_keeps_length_markers() {
        assert_eq!(normalize_phonemes("o ː k i ː"), "o ː k i ː");
    }

    #[test]
    fn filters_empty_and_overlong_words() {
        let long = "あ".repeat(51);
        let at_limit = "い".repeat(50);
        let d = dict(&[("", "x"), (long.as_str(), "x"), (at_limit.as_str(), "i")]);
        let samples = samples_from_dictionary(&d);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].word, at_limit);
    }

    #[test]
    fn split_sizes_sum_to_input() {
        let samples: Vec<Sample> = (0..103)
            .map(|i| Sample::ja(format!("word{i}"), "a"))
            .collect();
        let (train, val, test) = split_samples(samples.clone(), 0.8, 0.1, 7).unwrap();
        assert_eq!(train.len() + val.len() + test.len(), samples.len());
        assert_eq!(train.len(), 82); // floor(103 * 0.8)
        assert_eq!(val.len(), 10); // floor(103 * 0.1)
    }

    #[test]
    fn split_is_deterministic_for_a_fixed_seed() {
        let samples: Vec<Sample> = (0..50)
            .map(|i| Sample::ja(format!("word{i}"), "a"))
            .collect();
        let a = split_samples(samples.clone(), 0.7, 0.2, 42).unwrap();
        let b = split_samples(samples, 0.7, 0.2, 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn split_handles_empty_input() {
        let (train, val, test) = split_samples(Vec::new(), 0.8, 0.1, 0).unwrap();
        assert!(train.is_empty() && val.is_empty() && test.is_empty());
    }

    #[test]
    fn split_ratios_that_floor_to_zero_yield_empty_splits() {
        let samples = vec![Sample::ja("はい", "h a i")];
        let (train, val, test) = split_samples(samples, 0.0, 0.5, 1).unwrap();
        assert!(train.is_empty());
        assert!(val.is_empty());
        assert_eq!(test.len(), 1);
    }

    #[test]
    fn split_rejects_bad_ratios() {
        assert!(split_samples(Vec::new(), 0.9, 0.2, 0).is_err());
        assert!(split_samples(Vec::new(), -0.1, 0.0, 0).is_err());
    }

    #[test]
    fn split_two_entry_example() {
        // {"ありがとう": ..., "はい": ...} with train=0.5, val=0 always lands
        // one entry in train and one in test.
        let d = dict(&[("ありがとう", "a r i g a t o u"), ("はい", "h a i")]);
        let samples = samples_from_dictionary(&d);
        let (train, val, test) = split_samples(samples, 0.5, 0.0, 42).unwrap();
        assert_eq!((train.len(), val.len(), test.len()), (1, 0, 1));
    }

    #[test]
    fn augment_preserves_originals_in_order() {
        let samples = vec![
            Sample::ja("おはようございます", "o h a y o u"),
            Sample::ja("はい", "h a i"),
        ];
        let augmented = augment_samples(&samples);
        for original in &samples {
            assert!(augmented.contains(original));
        }
        assert_eq!(augmented[0], samples[0]);
    }

    #[test]
    fn augment_inserts_midpoint_space_for_long_unspaced_words() {
        // 9 chars, lowercasing a Japanese string is a no-op: exactly 2 entries.
        let samples = vec![Sample::ja("おはようございます", "o h a y o u")];
        let augmented = augment_samples(&samples);
        assert_eq!(augmented.len(), 2);
        assert_eq!(augmented[1].word, "おはよう ございます");
        assert_eq!(augmented[1].phonemes, "o h a y o u");
    }

    #[test]
    fn augment_skips_short_and_spaced_words() {
        let samples = vec![
            Sample::ja("はい", "h a i"),
            Sample::ja("こんに ちは", "k o n n i ch i w a"),
        ];
        assert_eq!(augment_samples(&samples).len(), 2);
    }

    #[test]
    fn augment_adds_lowercase_variant_for_latin_words() {
        let samples = vec![Sample::ja("OK", "o k e i")];
        let augmented = augment_samples(&samples);
        assert_eq!(augmented.len(), 2);
        assert_eq!(augmented[1].word, "ok");
    }

    #[test]
    fn augment_does_not_mutate_input() {
        let samples = vec![Sample::ja("ありがとう", "a r i g a t o u")];
        let before = samples.clone();
        let _ = augment_samples(&samples);
        assert_eq!(samples, before);
    }

    #[test]
    fn loader_reports_missing_file_as_data_error() {
        let err = load_dictionary(Path::new("/nonexistent/dict.json"), None).unwrap_err();
        assert!(matches!(err, crate::PipelineError::Data(_)));
    }

    #[test]
    fn loader_reports_invalid_json_as_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.json");
        fs::write(&path, "not json").unwrap();
        let err = load_dictionary(&path, None).unwrap_err();
        assert!(matches!(err, crate::PipelineError::Data(_)));
    }

    #[test]
    fn loader_rejects_empty_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.json");
        fs::write(&path, "{}").unwrap();
        assert!(load_dictionary(&path, None).is_err());
    }

    #[test]
    fn lexicon_overrides_dictionary_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dict_path = dir.path().join("dict.json");
        let lex_path = dir.path().join("lexicon.json");
        fs::write(&dict_path, r#"{"はい": "h a i", "いいえ": "i i e"}"#).unwrap();
        fs::write(&lex_path, r#"{"はい": "h a a i"}"#).unwrap();

        let merged = load_dictionary(&dict_path, Some(&lex_path)).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["はい"], "h a a i");
    }

    #[test]
    fn split_file_is_tab_separated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train_data.txt");
        let samples = vec![Sample::ja("はい", "h a i")];
        write_split_file(&path, &samples).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "ja\tはい\th a i\n");
    }

    #[test]
    fn vocabulary_reserves_zero_for_padding() {
        let samples = vec![Sample::ja("はい", "h a i")];
        let vocab = Vocabulary::build(&[&samples]);
        assert_eq!(vocab.vocab_size(), 3); // pad + は + い
        assert_eq!(vocab.phoneme_size(), 4); // pad + h + a + i
        let encoded = vocab.encode_word("はい");
        assert_eq!(encoded.len(), vocab.seq_len); // seq_len driven by "h a i"
        assert!(encoded[0] != PAD_ID && encoded[1] != PAD_ID);
        assert_eq!(encoded[2], PAD_ID);
    }

    #[test]
    fn vocabulary_covers_augmented_space_variant() {
        let samples = vec![Sample::ja("おはようございます", "o h a y o u")];
        let augmented = augment_samples(&samples);
        let vocab = Vocabulary::build(&[&samples, &augmented]);
        let spaced = vocab.encode_word("おはよう ございます");
        // The inserted space must not fall back to padding.
        assert_ne!(spaced[4], PAD_ID);
    }

    #[test]
    fn encoded_dataset_pads_to_shared_length() {
        let samples = vec![
            Sample::ja("ありがとう", "a r i g a t o u"),
            Sample::ja("はい", "h a i"),
        ];
        let vocab = Vocabulary::build(&[&samples]);
        assert_eq!(vocab.seq_len, 8); // longest phoneme sequence wins
        let encoded = EncodedDataset::encode(&vocab, &samples);
        assert_eq!(encoded.len(), 2);
        for row in encoded.inputs.iter().chain(encoded.targets.iter()) {
            assert_eq!(row.len(), 8);
        }
    }
}
