use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::bail;
use fs_err as fs;
use serde::Serialize;
use serde_json::ser::{CompactFormatter, PrettyFormatter};
use serde_json::Value;

use crate::config::{FeedEncoding, FeedFormat, FeedOptions, Settings};

/// A scraped record.
pub type Item = serde_json::Map<String, Value>;

/// All the feeds configured in `FEEDS`.
#[derive(Debug)]
pub struct Feeds {
    exporters: Vec<FeedExporter>,
}

impl Feeds {
    pub fn open(settings: &Settings) -> anyhow::Result<Self> {
        let exporters = settings
            .feeds
            .iter()
            .map(|(path, options)| {
                FeedExporter::open(path, options, settings.feed_encoding(options))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { exporters })
    }

    pub fn export(&mut self, item: &Item) -> anyhow::Result<()> {
        for exporter in &mut self.exporters {
            exporter.export(item)?;
        }
        Ok(())
    }

    pub fn close(self) -> anyhow::Result<()> {
        for exporter in self.exporters {
            exporter.close()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }
}

#[derive(Debug)]
enum FeedWriter {
    JsonLines(BufWriter<fs::File>),
    Json(BufWriter<fs::File>),
    Csv {
        wtr: csv::Writer<fs::File>,
        columns: Option<Vec<String>>,
        needs_header: bool,
    },
}

/// Writes items to a single feed file.
#[derive(Debug)]
pub struct FeedExporter {
    path: PathBuf,
    format: FeedFormat,
    encoding: FeedEncoding,
    fields: Option<Vec<String>>,
    indent: Option<usize>,
    writer: FeedWriter,
    exported: usize,
}

impl FeedExporter {
    /// Opens the feed file, appending to it unless `overwrite` is set.
    pub fn open<P: AsRef<Path>>(
        path: P,
        options: &FeedOptions,
        encoding: FeedEncoding,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if options.format == FeedFormat::Csv && encoding == FeedEncoding::Ascii {
            bail!("Couldn't open {}, csv feeds require utf-8", path.display());
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut opts = fs::OpenOptions::new();
        opts.create(true);
        if options.overwrite {
            opts.write(true).truncate(true);
        } else {
            opts.append(true);
        }
        let file = opts.open(path)?;
        let is_empty = file.metadata()?.len() == 0;

        let writer = match options.format {
            FeedFormat::JsonLines => FeedWriter::JsonLines(BufWriter::new(file)),
            FeedFormat::Json => FeedWriter::Json(BufWriter::new(file)),
            FeedFormat::Csv => {
                let columns = match &options.fields {
                    Some(fields) => Some(fields.clone()),
                    None if !is_empty => Some(existing_header(path)?),
                    None => None,
                };
                FeedWriter::Csv {
                    wtr: csv::WriterBuilder::new().from_writer(file),
                    columns,
                    needs_header: is_empty,
                }
            }
        };

        log::debug!("Opened {} feed {}", options.format, path.display());

        Ok(Self {
            path: path.to_path_buf(),
            format: options.format,
            encoding,
            fields: options.fields.clone(),
            indent: options.indent,
            writer,
            exported: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exported(&self) -> usize {
        self.exported
    }

    pub fn export(&mut self, item: &Item) -> anyhow::Result<()> {
        let selected = self.select(item);
        match &mut self.writer {
            FeedWriter::JsonLines(wtr) => {
                let line = to_json(&selected, None, self.encoding)?;
                wtr.write_all(line.as_bytes())?;
                wtr.write_all(b"\n")?;
            }
            FeedWriter::Json(wtr) => {
                let json = to_json(&selected, self.indent, self.encoding)?;
                if self.exported == 0 {
                    wtr.write_all(b"[")?;
                } else {
                    wtr.write_all(b",")?;
                }
                wtr.write_all(b"\n")?;
                wtr.write_all(json.as_bytes())?;
            }
            FeedWriter::Csv {
                wtr,
                columns,
                needs_header,
            } => {
                let columns = columns.get_or_insert_with(|| item.keys().cloned().collect());
                if *needs_header {
                    wtr.write_record(columns.iter())?;
                    *needs_header = false;
                }
                wtr.write_record(
                    columns
                        .iter()
                        .map(|column| csv_field(item.get(column).unwrap_or(&Value::Null))),
                )?;
            }
        }
        self.exported += 1;
        Ok(())
    }

    pub fn close(self) -> anyhow::Result<()> {
        match self.writer {
            FeedWriter::JsonLines(mut wtr) => wtr.flush()?,
            FeedWriter::Json(mut wtr) => {
                if self.exported == 0 {
                    wtr.write_all(b"[")?;
                }
                wtr.write_all(b"\n]")?;
                wtr.flush()?;
            }
            FeedWriter::Csv { mut wtr, .. } => wtr.flush()?,
        }
        log::info!(
            "Stored {} feed ({} items) in: {}",
            self.format,
            self.exported,
            self.path.display()
        );
        Ok(())
    }

    /// Restricts `item` to the configured fields, in their order.
    fn select(&self, item: &Item) -> Item {
        match &self.fields {
            Some(fields) => fields
                .iter()
                .map(|field| {
                    let value = item.get(field).cloned().unwrap_or(Value::Null);
                    (field.clone(), value)
                })
                .collect(),
            None => item.clone(),
        }
    }
}

/// Columns of the header row already written in a csv feed.
fn existing_header(path: &Path) -> anyhow::Result<Vec<String>> {
    let mut rdr = csv::Reader::from_reader(fs::File::open(path)?);
    Ok(rdr.headers()?.iter().map(String::from).collect())
}

fn to_json(item: &Item, indent: Option<usize>, encoding: FeedEncoding) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    match indent {
        Some(width) => {
            let indent = " ".repeat(width);
            let mut ser = serde_json::Serializer::with_formatter(
                &mut buf,
                PrettyFormatter::with_indent(indent.as_bytes()),
            );
            item.serialize(&mut ser)?;
        }
        None => {
            let mut ser = serde_json::Serializer::with_formatter(&mut buf, CompactFormatter);
            item.serialize(&mut ser)?;
        }
    }
    let json = String::from_utf8(buf)?;
    Ok(match encoding {
        FeedEncoding::Utf8 => json,
        FeedEncoding::Ascii => escape_non_ascii(&json),
    })
}

/// Escapes every non-ASCII char as `\uXXXX`, with surrogate pairs above
/// U+FFFF. Only valid on serialized JSON where such chars are inside strings.
fn escape_non_ascii(json: &str) -> String {
    let mut escaped = String::with_capacity(json.len());
    let mut units = [0u16; 2];
    for c in json.chars() {
        if c.is_ascii() {
            escaped.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    escaped
}

fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
