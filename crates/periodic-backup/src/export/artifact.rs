use std::{
    fs::File,
    io::{BufRead, BufReader, Read, Write},
    path::Path,
};

use chrono::{DateTime, Utc};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};

use crate::encryption::{DecryptingReader, EncryptionKey};

use super::{ExportError, ExportItem, Watermarks};

/// The first line of a logical artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    /// The database that was exported.
    pub database: String,

    /// If the artifact holds a full export.
    pub is_full: bool,

    /// When the export started.
    pub created_at: DateTime<Utc>,

    /// The first watermarks included.
    pub start: Watermarks,
}

#[derive(Serialize)]
#[serde(tag = "line", content = "value", rename_all = "snake_case")]
enum LineRef<'a> {
    Header(&'a ArtifactHeader),
    Item(&'a ExportItem),
    End(&'a Watermarks),
}

#[derive(Deserialize)]
#[serde(tag = "line", content = "value", rename_all = "snake_case")]
enum Line {
    Header(ArtifactHeader),
    Item(ExportItem),
    End(Watermarks),
}

/// Writes a gzip compressed JSON lines artifact.
pub struct ArtifactWriter<W: Write> {
    encoder: GzEncoder<W>,
    items: u64,
}

impl<W: Write> ArtifactWriter<W> {
    /// Start an artifact, writing its header.
    pub fn new(out: W, header: &ArtifactHeader) -> Result<Self, ExportError> {
        let mut writer = Self {
            encoder: GzEncoder::new(out, Compression::default()),
            items: 0,
        };
        writer.write_line(&LineRef::Header(header))?;

        Ok(writer)
    }

    /// Write one item.
    pub fn write_item(&mut self, item: &ExportItem) -> Result<(), ExportError> {
        self.write_line(&LineRef::Item(item))?;
        self.items += 1;
        Ok(())
    }

    /// The number of items written.
    pub fn items(&self) -> u64 {
        self.items
    }

    /// Write the end line with the captured watermarks and return the output.
    pub fn finish(mut self, watermarks: Watermarks) -> Result<W, ExportError> {
        self.write_line(&LineRef::End(&watermarks))?;
        self.encoder
            .finish()
            .map_err(|e| ExportError::Io(e, "finish the compressed stream"))
    }

    fn write_line(&mut self, line: &LineRef<'_>) -> Result<(), ExportError> {
        serde_json::to_writer(&mut self.encoder, line)?;
        self.encoder
            .write_all(b"\n")
            .map_err(|e| ExportError::Io(e, "write the artifact"))
    }
}

/// A logical artifact read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactContents {
    /// The header line.
    pub header: ArtifactHeader,

    /// Every item in the order written.
    pub items: Vec<ExportItem>,

    /// The watermarks the export captured.
    pub end: Watermarks,
}

/// Read a logical artifact, decrypting it with `key` if given.
pub fn read_artifact(
    path: &Path,
    key: Option<&EncryptionKey>,
) -> Result<ArtifactContents, ExportError> {
    let file = File::open(path).map_err(|e| ExportError::Io(e, "open the artifact"))?;
    let reader: Box<dyn Read> = match key {
        Some(key) => Box::new(DecryptingReader::new(BufReader::new(file), key)?),
        None => Box::new(BufReader::new(file)),
    };

    let mut header = None;
    let mut items = Vec::new();
    let mut end = None;

    for line in BufReader::new(GzDecoder::new(reader)).lines() {
        let line = line.map_err(|e| ExportError::Io(e, "read the artifact"))?;
        if line.is_empty() {
            continue;
        }

        if end.is_some() {
            return Err(ExportError::Malformed("data after the end line".to_string()));
        }

        match serde_json::from_str(&line)? {
            Line::Header(value) if header.is_none() => header = Some(value),
            Line::Header(_) => {
                return Err(ExportError::Malformed("more than one header".to_string()));
            }
            Line::Item(_) | Line::End(_) if header.is_none() => {
                return Err(ExportError::Malformed("missing header".to_string()));
            }
            Line::Item(item) => items.push(item),
            Line::End(watermarks) => end = Some(watermarks),
        }
    }

    let header = header.ok_or_else(|| ExportError::Malformed("missing header".to_string()))?;
    let end = end.ok_or_else(|| ExportError::Malformed("missing end line".to_string()))?;

    Ok(ArtifactContents { header, items, end })
}
