use crate::input::IndexedInput;
use md5;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise while keeping saved inputs.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested input ID was not found within the corpus.
    #[error("Input ID {0} not found in corpus")]
    InputNotFound(usize),

    /// An I/O error occurred while writing the output directory or reading
    /// input files. Contains a description of the underlying error.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// The corpus index could not be serialized.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Serialization(format!("JSON operation error: {err}"))
    }
}

/// Index record for one saved input, persisted as JSON next to the inputs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SavedEntryMetadata {
    pub file_name: String,
    /// Number of bytes written for the entry.
    pub size: usize,
    pub favoured: bool,
    /// Trial number at which the input was saved.
    pub trial: u64,
    pub md5: String,
}

/// The set of inputs a guidance retains as parents for further mutation.
/// Entries are never modified after insertion.
pub trait Corpus: Send {
    /// Adds an input saved at trial `trial` and returns its ID.
    fn add(&mut self, input: IndexedInput, trial: u64) -> Result<usize, CorpusError>;

    fn get(&self, id: usize) -> Option<&IndexedInput>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A corpus held only in memory.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    entries: Vec<IndexedInput>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Corpus for InMemoryCorpus {
    fn add(&mut self, input: IndexedInput, _trial: u64) -> Result<usize, CorpusError> {
        self.entries.push(input);
        Ok(self.entries.len() - 1)
    }

    fn get(&self, id: usize) -> Option<&IndexedInput> {
        self.entries.get(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A corpus that also writes every saved input to an output directory.
///
/// Each input is stored as a raw byte file named `id_NNNNNN` holding the bytes
/// the input supplied during the run that saved it, in request order, so the
/// files can be replayed directly. A JSON index describes all entries.
pub struct OnDiskCorpus {
    directory: PathBuf,
    index_file_path: PathBuf,
    entries: Vec<IndexedInput>,
    index: Vec<SavedEntryMetadata>,
}

impl OnDiskCorpus {
    pub const INDEX_FILENAME: &'static str = "corpus_index.json";

    /// Prepares `directory` for a fresh session: creates it if needed and
    /// removes any files left there by an earlier run.
    pub fn new(directory: PathBuf) -> Result<Self, CorpusError> {
        if !directory.exists() {
            fs::create_dir_all(&directory).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to create output directory {directory:?}: {e}"
                ))
            })?;
        } else if !directory.is_dir() {
            return Err(CorpusError::Io(format!(
                "Output path {directory:?} exists but is not a directory"
            )));
        }

        for entry in fs::read_dir(&directory)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path).map_err(|e| {
                    CorpusError::Io(format!("Failed to clear stale file {path:?}: {e}"))
                })?;
            }
        }

        let index_file_path = directory.join(Self::INDEX_FILENAME);
        let corpus = Self {
            directory,
            index_file_path,
            entries: Vec::new(),
            index: Vec::new(),
        };
        corpus.save_index()?;
        Ok(corpus)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn metadata(&self) -> &[SavedEntryMetadata] {
        &self.index
    }

    fn save_index(&self) -> Result<(), CorpusError> {
        let file = File::create(&self.index_file_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create or truncate index file {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.index)?;
        Ok(())
    }
}

impl Corpus for OnDiskCorpus {
    fn add(&mut self, input: IndexedInput, trial: u64) -> Result<usize, CorpusError> {
        let id = self.entries.len();
        let file_name = format!("id_{id:06}");
        let file_path = self.directory.join(&file_name);
        let bytes = input.consumed_bytes();

        let mut writer = BufWriter::new(File::create(&file_path).map_err(|e| {
            CorpusError::Io(format!("Failed to create input file {file_path:?}: {e}"))
        })?);
        writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .map_err(|e| CorpusError::Io(format!("Failed to write input file {file_path:?}: {e}")))?;

        self.index.push(SavedEntryMetadata {
            file_name,
            size: bytes.len(),
            favoured: input.is_favoured(),
            trial,
            md5: format!("{:x}", md5::compute(&bytes)),
        });
        self.entries.push(input);
        self.save_index()?;
        Ok(id)
    }

    fn get(&self, id: usize) -> Option<&IndexedInput> {
        self.entries.get(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Expands a path into the input files it names: the file itself, or the
/// regular, non-hidden files directly inside a directory, sorted by name.
pub fn resolve_input_files(path: &Path) -> Result<Vec<PathBuf>, CorpusError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(CorpusError::Io(format!(
            "Input path {path:?} is neither a file nor a directory"
        )));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path)
        .map_err(|e| CorpusError::Io(format!("Failed to read input directory {path:?}: {e}")))?
    {
        let file_path = entry?.path();
        let hidden = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        if file_path.is_file() && !hidden {
            files.push(file_path);
        }
    }
    files.sort();
    Ok(files)
}
