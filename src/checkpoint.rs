//! Persistent storage of sampler state.
//!
//! Everything the sampler persists is a [`Table`]: a list of fixed-width
//! `f64` fields, a number of rows and a set of scalar attributes. Tables live
//! at slash separated paths like `/data/3/components`. Two backends are
//! provided, an in-memory map and a directory tree of CSV files.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

/// Version of the table layout, stored in `/meta`.
pub const FORMAT_VERSION: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub width: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    fields: Vec<Field>,
    rows: Vec<Vec<f64>>,
    attributes: BTreeMap<String, f64>,
}

impl Table {
    pub fn new(fields: &[(&str, usize)]) -> Self {
        Self {
            fields: fields
                .iter()
                .map(|&(name, width)| Field {
                    name: name.to_string(),
                    width,
                })
                .collect(),
            rows: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// A table without fields, used for attribute-only entries like `/meta`.
    pub fn attributes_only() -> Self {
        Self::default()
    }

    pub fn with_attribute(mut self, name: &str, value: f64) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn set_attribute(&mut self, name: &str, value: f64) {
        self.attributes.insert(name.to_string(), value);
    }

    pub fn attribute(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).copied()
    }

    pub fn require_attribute(&self, name: &str) -> Result<f64> {
        self.attribute(name)
            .ok_or_else(|| anyhow!("Missing attribute '{}'", name))
    }

    pub fn attributes(&self) -> &BTreeMap<String, f64> {
        &self.attributes
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn row_width(&self) -> usize {
        self.fields.iter().map(|field| field.width).sum()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Append a row given as one slice per field.
    pub fn push(&mut self, values: &[&[f64]]) -> Result<()> {
        if values.len() != self.fields.len() {
            bail!(
                "Expected {} fields in row, got {}",
                self.fields.len(),
                values.len()
            );
        }
        let mut row = Vec::with_capacity(self.row_width());
        for (field, value) in self.fields.iter().zip(values) {
            if field.width != value.len() {
                bail!(
                    "Field '{}' has width {}, got {} values",
                    field.name,
                    field.width,
                    value.len()
                );
            }
            row.extend_from_slice(value);
        }
        self.rows.push(row);
        Ok(())
    }

    fn push_flat(&mut self, row: Vec<f64>) -> Result<()> {
        if row.len() != self.row_width() {
            bail!("Expected row of width {}, got {}", self.row_width(), row.len());
        }
        self.rows.push(row);
        Ok(())
    }

    fn field_range(&self, name: &str) -> Result<std::ops::Range<usize>> {
        let mut offset = 0;
        for field in self.fields.iter() {
            if field.name == name {
                return Ok(offset..offset + field.width);
            }
            offset += field.width;
        }
        Err(anyhow!("Unknown field '{}'", name))
    }

    pub fn field_width(&self, name: &str) -> Result<usize> {
        Ok(self.field_range(name)?.len())
    }

    /// Values of field `name` in row `row`.
    pub fn get(&self, row: usize, name: &str) -> Result<&[f64]> {
        let range = self.field_range(name)?;
        let row = self
            .rows
            .get(row)
            .ok_or_else(|| anyhow!("Row {} out of range ({} rows)", row, self.rows.len()))?;
        Ok(&row[range])
    }

    pub fn scalar(&self, row: usize, name: &str) -> Result<f64> {
        let values = self.get(row, name)?;
        match values {
            [value] => Ok(*value),
            _ => Err(anyhow!("Field '{}' is not a scalar", name)),
        }
    }

    /// All values of a scalar field.
    pub fn column(&self, name: &str) -> Result<Vec<f64>> {
        (0..self.len()).map(|row| self.scalar(row, name)).collect()
    }
}

/// Join a table path prefix and a child name.
pub fn join(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

/// Hierarchical table storage.
pub trait Checkpoint {
    fn write_table(&mut self, path: &str, table: &Table) -> Result<()>;

    fn read_table(&self, path: &str) -> Result<Table>;

    fn contains(&self, path: &str) -> bool;

    /// Names of the direct children of `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Checkpoint kept entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoint {
    tables: BTreeMap<String, Table>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|key| key.as_str())
    }
}

impl Checkpoint for MemoryCheckpoint {
    fn write_table(&mut self, path: &str, table: &Table) -> Result<()> {
        self.tables.insert(path.to_string(), table.clone());
        Ok(())
    }

    fn read_table(&self, path: &str) -> Result<Table> {
        self.tables
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("No table at '{}'", path))
    }

    fn contains(&self, path: &str) -> bool {
        self.tables.contains_key(path)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let children: BTreeSet<String> = self
            .tables
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .collect();
        Ok(children.into_iter().collect())
    }
}

/// Checkpoint stored as a directory tree with one CSV file per table.
///
/// The table at `/data/0/components` is written to
/// `<root>/data/0/components.csv`. Attributes are written as leading
/// `# name=value` lines, followed by one header row and the data rows.
/// Fields wider than one value get the column names `name.0`, `name.1`, ...
pub struct CsvCheckpoint {
    root: PathBuf,
}

impl CsvCheckpoint {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_path(&self, path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            out.push(part);
        }
        out
    }

    fn file_path(&self, path: &str) -> PathBuf {
        let mut out = self.dir_path(path);
        let name = out
            .file_name()
            .map(|name| format!("{}.csv", name.to_string_lossy()))
            .unwrap_or_else(|| "root.csv".to_string());
        out.set_file_name(name);
        out
    }
}

fn header_names(fields: &[Field]) -> Vec<String> {
    let mut names = Vec::new();
    for field in fields {
        if field.width == 1 {
            names.push(field.name.clone());
        } else {
            names.extend((0..field.width).map(|k| format!("{}.{}", field.name, k)));
        }
    }
    names
}

fn parse_header(line: &str) -> Vec<Field> {
    let mut fields: Vec<Field> = Vec::new();
    if line.is_empty() {
        return fields;
    }
    for column in line.split(',') {
        if let Some((base, index)) = column.rsplit_once('.') {
            if let Ok(index) = index.parse::<usize>() {
                match fields.last_mut() {
                    Some(last) if last.name == base && last.width == index && index > 0 => {
                        last.width += 1;
                    }
                    _ => fields.push(Field {
                        name: base.to_string(),
                        width: 1,
                    }),
                }
                continue;
            }
        }
        fields.push(Field {
            name: column.to_string(),
            width: 1,
        });
    }
    fields
}

impl Checkpoint for CsvCheckpoint {
    fn write_table(&mut self, path: &str, table: &Table) -> Result<()> {
        let file_path = self.file_path(path);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let file = File::create(&file_path)
            .with_context(|| format!("Failed to create CSV file: {:?}", file_path))?;
        let mut writer = BufWriter::new(file);

        for (name, value) in table.attributes.iter() {
            writeln!(writer, "# {}={}", name, value)?;
        }
        writeln!(writer, "{}", header_names(&table.fields).join(","))?;
        for row in table.rows.iter() {
            let line: Vec<String> = row.iter().map(|value| value.to_string()).collect();
            writeln!(writer, "{}", line.join(","))?;
        }
        writer
            .flush()
            .with_context(|| format!("Failed to write CSV file: {:?}", file_path))?;
        Ok(())
    }

    fn read_table(&self, path: &str) -> Result<Table> {
        let file_path = self.file_path(path);
        let content = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read CSV file: {:?}", file_path))?;

        let mut table = Table::default();
        let mut lines = content.lines();
        let mut header = None;
        for line in lines.by_ref() {
            if let Some(attribute) = line.strip_prefix("# ") {
                let (name, value) = attribute
                    .split_once('=')
                    .ok_or_else(|| anyhow!("Malformed attribute line '{}'", line))?;
                let value = value
                    .parse::<f64>()
                    .with_context(|| format!("Invalid value for attribute '{}'", name))?;
                table.set_attribute(name, value);
            } else {
                header = Some(line);
                break;
            }
        }
        table.fields = parse_header(header.unwrap_or(""));

        for (idx, line) in lines.enumerate() {
            if line.is_empty() {
                continue;
            }
            let row = line
                .split(',')
                .map(|value| value.parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .with_context(|| format!("Invalid number in row {} of {:?}", idx, file_path))?;
            table.push_flat(row)?;
        }
        Ok(table)
    }

    fn contains(&self, path: &str) -> bool {
        self.file_path(path).is_file()
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.dir_path(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut children = BTreeSet::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list directory: {:?}", dir))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() {
                children.insert(name);
            } else if let Some(stem) = name.strip_suffix(".csv") {
                children.insert(stem.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }
}
