// The MIT License (MIT)

// Copyright (c) 2014 Y. T. CHUNG

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Settings file loader for Rust
//!
//! Sections are keyed by their full header line, brackets included. Key lines
//! that appear before the first header belong to `[Default]`.
//!
//! ```no_run
//! use settings_store::SettingsStore;
//!
//! let mut settings = SettingsStore::default();
//! settings.load().unwrap();
//! settings.set("[User]", "name", "Raspberry");
//! settings.save().unwrap();
//!
//! for (section, props) in settings.attributes() {
//!     println!("{}", section);
//!     for (k, v) in props {
//!         println!("{} = {}", k, v);
//!     }
//! }
//! ```

use std::{
    borrow::Cow,
    collections::HashSet,
    fmt,
    fs::{self, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use ordered_multimap::{
    list_ordered_multimap::{Entry, Iter, Keys},
    ListOrderedMultimap,
};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Section receiving key lines before the first header
pub const DEFAULT_SECTION: &str = "[Default]";

/// File used by [`SettingsStore::default`]
pub const DEFAULT_FILE_NAME: &str = "settings.ini";

/// Loading configuration
#[derive(Debug, Clone, Default)]
pub struct LoadOption {
    /// Fail with [`Error::Io`] when the backing file cannot be read.
    ///
    /// By default a missing or unreadable file loads as an empty store.
    pub require_file: bool,
}

/// Newline style
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LineSeparator {
    /// System-dependent line separator
    ///
    /// On UNIX system, uses "\n"
    /// On Windows system, uses "\r\n"
    SystemDefault,

    /// Uses "\n" as new line separator
    LF,

    /// Uses "\r\n" as new line separator
    CRLF,
}

#[cfg(not(windows))]
static DEFAULT_LINE_SEPARATOR: &str = "\n";

#[cfg(windows)]
static DEFAULT_LINE_SEPARATOR: &str = "\r\n";

impl fmt::Display for LineSeparator {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.write_str(self.as_str())
    }
}

impl LineSeparator {
    /// String representation
    pub fn as_str(self) -> &'static str {
        match self {
            LineSeparator::SystemDefault => DEFAULT_LINE_SEPARATOR,
            LineSeparator::LF => "\n",
            LineSeparator::CRLF => "\r\n",
        }
    }
}

/// Writing configuration
#[derive(Debug, Clone)]
pub struct WriteOption {
    /// Newline style
    pub line_separator: LineSeparator,

    /// Write into a sibling temporary file, then rename it over the target.
    ///
    /// When disabled the target is truncated and written in place, so a failure
    /// halfway leaves a partially written file behind.
    pub atomic: bool,
}

impl Default for WriteOption {
    fn default() -> WriteOption {
        WriteOption {
            line_separator: LineSeparator::SystemDefault,
            atomic: true,
        }
    }
}

/// Attributes of one section, in the order they were defined or last updated
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Properties {
    data: ListOrderedMultimap<String, String>,
}

impl Properties {
    /// Create an instance
    pub fn new() -> Properties {
        Default::default()
    }

    /// Get the number of the properties
    pub fn len(&self) -> usize {
        self.data.keys_len()
    }

    /// Check if properties has 0 elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get an iterator of the properties
    pub fn iter(&self) -> PropertyIter<'_> {
        PropertyIter {
            inner: self.data.iter(),
        }
    }

    /// Return true if property exist
    pub fn contains_key<S: AsRef<str>>(&self, s: S) -> bool {
        self.data.contains_key(s.as_ref())
    }

    /// Get the value associated with the key
    pub fn get<S: AsRef<str>>(&self, s: S) -> Option<&str> {
        self.data.get(s.as_ref()).map(|v| v.as_str())
    }

    /// Set the value of `k` and move it behind every other key.
    ///
    /// Returns the previous value if the key existed.
    pub fn replace<K, V>(&mut self, k: K, v: V) -> Option<String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let k = k.into();
        let old = self.data.remove(k.as_str());
        self.data.append(k, v.into());
        old
    }

    /// Remove the property, return its value if it existed
    pub fn remove<S: AsRef<str>>(&mut self, s: S) -> Option<String> {
        self.data.remove(s.as_ref())
    }
}

pub struct PropertyIter<'a> {
    inner: Iter<'a, String, String>,
}

impl<'a> Iterator for PropertyIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for PropertyIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<'a> IntoIterator for &'a Properties {
    type IntoIter = PropertyIter<'a>;
    type Item = (&'a str, &'a str);

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

type Sections = ListOrderedMultimap<String, Properties>;

// Existing sections keep their position
fn section_entry<'a>(sections: &'a mut Sections, name: &str) -> &'a mut Properties {
    match sections.entry(name.to_owned()) {
        Entry::Occupied(e) => e.into_mut(),
        Entry::Vacant(e) => e.insert(Properties::new()),
    }
}

/// Sectioned key/value settings backed by a file
#[derive(Debug, Clone)]
pub struct SettingsStore {
    sections: Sections,
    raw_lines: Vec<String>,
    path: PathBuf,
    dirty: bool,
}

impl Default for SettingsStore {
    /// Creates a store backed by `settings.ini` in the working directory
    fn default() -> Self {
        SettingsStore::new(DEFAULT_FILE_NAME)
    }
}

impl SettingsStore {
    /// Create an empty store backed by `path`. Nothing is read until [`SettingsStore::load`].
    pub fn new<P: AsRef<Path>>(path: P) -> SettingsStore {
        SettingsStore {
            sections: Sections::new(),
            raw_lines: Vec::new(),
            path: path.as_ref().to_path_buf(),
            dirty: false,
        }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`SettingsStore::set`] was called since the last load or save
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Get a section, `None` if it was never declared or set
    pub fn section<S: AsRef<str>>(&self, name: S) -> Option<&Properties> {
        self.sections.get(name.as_ref())
    }

    /// Get a section's attributes, empty if the section does not exist.
    ///
    /// Never creates the section.
    pub fn get_section<S: AsRef<str>>(&self, name: S) -> Cow<'_, Properties> {
        match self.section(name) {
            Some(props) => Cow::Borrowed(props),
            None => Cow::Owned(Properties::new()),
        }
    }

    /// Get a value from a section
    pub fn get<S: AsRef<str>>(&self, section: S, key: &str) -> Option<&str> {
        self.section(section).and_then(|prop| prop.get(key))
    }

    /// Iterate sections with their attributes, in section order
    pub fn attributes(&self) -> SectionIter<'_> {
        SectionIter {
            inner: self.sections.iter(),
        }
    }

    /// Iterate section names
    pub fn sections(&self) -> SectionNames<'_> {
        SectionNames {
            inner: self.sections.keys(),
        }
    }

    /// Lines of the backing file as read by the last load, comments included
    pub fn configuration(&self) -> &[String] {
        &self.raw_lines
    }

    /// Total sections count
    pub fn len(&self) -> usize {
        self.sections.keys_len()
    }

    /// Check if the store contains no section
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Set `key` in `section`, creating the section at the end if needed.
    ///
    /// An existing key is moved behind the others. An empty section name means
    /// `[Default]`. Always returns `true`.
    pub fn set<S, K, V>(&mut self, section: S, key: K, value: V) -> bool
    where
        S: AsRef<str>,
        K: Into<String>,
        V: Into<String>,
    {
        let section = match section.as_ref() {
            "" => DEFAULT_SECTION,
            s => s,
        };
        section_entry(&mut self.sections, section).replace(key, value);
        self.dirty = true;
        true
    }
}

impl SettingsStore {
    /// Load the backing file, replacing the current content.
    ///
    /// A missing or unreadable file loads as empty, see [`LoadOption::require_file`].
    pub fn load(&mut self) -> Result<(), Error> {
        self.load_opt(LoadOption::default())
    }

    /// Load the backing file with options
    pub fn load_opt(&mut self, opt: LoadOption) -> Result<(), Error> {
        let buf = match fs::read(&self.path) {
            Ok(buf) => buf,
            Err(err) if opt.require_file => return Err(Error::Io(err)),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unable to read settings file, loading it as empty");
                Vec::new()
            }
        };

        let lines = split_lines(&buf)?;
        self.load_lines(lines);
        Ok(())
    }

    /// Load from a string instead of the backing file
    pub fn load_from_str(&mut self, buf: &str) -> Result<(), ParseError> {
        let lines = split_lines(buf.as_bytes())?;
        self.load_lines(lines);
        Ok(())
    }

    fn load_lines(&mut self, lines: Vec<String>) {
        self.sections = Parser::new().parse(lines.iter().map(String::as_str));
        self.raw_lines = lines;
        self.dirty = false;
        debug!(
            path = %self.path.display(),
            lines = self.raw_lines.len(),
            sections = self.sections.keys_len(),
            "settings loaded"
        );
    }
}

impl SettingsStore {
    /// Write every section to the backing file
    pub fn save(&mut self) -> Result<(), Error> {
        self.save_opt(WriteOption::default())
    }

    /// Write every section to the backing file with options
    pub fn save_opt(&mut self, opt: WriteOption) -> Result<(), Error> {
        if opt.atomic {
            self.write_atomic(&opt)?;
        } else {
            self.write_to_file(&self.path, &opt)?;
        }

        self.dirty = false;
        debug!(path = %self.path.display(), sections = self.sections.keys_len(), "settings saved");
        Ok(())
    }

    // The temporary file is removed on drop unless it was persisted
    fn write_atomic(&self, opt: &WriteOption) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        self.write_to_opt(&mut BufWriter::new(tmp.as_file_mut()), opt)?;

        match fs::metadata(&self.path) {
            Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn write_to_file(&self, path: &Path, opt: &WriteOption) -> io::Result<()> {
        let file = OpenOptions::new().write(true).truncate(true).create(true).open(path)?;
        let mut writer = BufWriter::new(file);
        self.write_to_opt(&mut writer, opt)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }

    /// Write to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.write_to_opt(writer, &WriteOption::default())
    }

    /// Write to a writer with options
    pub fn write_to_opt<W: Write>(&self, writer: &mut W, opt: &WriteOption) -> io::Result<()> {
        for (section, props) in &self.sections {
            write!(writer, "{}{}", section, opt.line_separator)?;
            for (k, v) in props {
                write!(writer, "{}={}{}", k, v, opt.line_separator)?;
            }
        }
        writer.flush()
    }
}

/// Iterator for traversing sections
pub struct SectionIter<'a> {
    inner: Iter<'a, String, Properties>,
}

impl<'a> Iterator for SectionIter<'a> {
    type Item = (&'a str, &'a Properties);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| (k.as_str(), v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for SectionIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|(k, v)| (k.as_str(), v))
    }
}

/// Iterator over section names
pub struct SectionNames<'a> {
    inner: Keys<'a, String>,
}

impl<'a> Iterator for SectionNames<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(String::as_str)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<'a> IntoIterator for &'a SettingsStore {
    type IntoIter = SectionIter<'a>;
    type Item = (&'a str, &'a Properties);

    fn into_iter(self) -> Self::IntoIter {
        self.attributes()
    }
}

/// Parse error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {msg}")]
pub struct ParseError {
    pub line: usize,
    pub msg: Cow<'static, str>,
}

/// Error while loading or saving settings
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

// Split on '\n', dropping a trailing '\r' and a leading UTF-8 BOM
fn split_lines(buf: &[u8]) -> Result<Vec<String>, ParseError> {
    let buf = buf.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(buf);
    if buf.is_empty() {
        return Ok(Vec::new());
    }

    let body = buf.strip_suffix(b"\n").unwrap_or(buf);
    body.split(|&b| b == b'\n')
        .enumerate()
        .map(|(idx, line)| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            match std::str::from_utf8(line) {
                Ok(s) => Ok(s.to_owned()),
                Err(err) => Err(ParseError {
                    line: idx + 1,
                    msg: format!("invalid UTF-8: {}", err).into(),
                }),
            }
        })
        .collect()
}

/// Cut `line` at the first `;` outside a double-quoted span.
///
/// An unterminated quote runs to the end of the line.
fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ';' if !quoted => return &line[..idx],
            _ => {}
        }
    }
    line
}

// Settings parser
struct Parser {
    sections: Sections,
    active: String,
    // keys seen since the active section's header
    run_keys: HashSet<String>,
}

impl Parser {
    fn new() -> Parser {
        Parser {
            sections: Sections::new(),
            active: DEFAULT_SECTION.to_owned(),
            run_keys: HashSet::new(),
        }
    }

    fn parse<'a, I>(mut self, lines: I) -> Sections
    where
        I: IntoIterator<Item = &'a str>,
    {
        for (idx, raw) in lines.into_iter().enumerate() {
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                self.parse_section(line);
                continue;
            }

            match line.split_once('=') {
                Some((key, value)) => self.parse_property(key, value),
                None => warn!(line = idx + 1, content = line, "invalid key/value pair in settings file"),
            }
        }
        self.sections
    }

    // A re-declared section moves to the end, keeping its attributes
    fn parse_section(&mut self, name: &str) {
        let props = self.sections.remove(name).unwrap_or_default();
        self.sections.append(name.to_owned(), props);
        self.active = name.to_owned();
        self.run_keys.clear();
    }

    fn parse_property(&mut self, key: &str, value: &str) {
        if !self.run_keys.insert(key.to_owned()) {
            debug!(section = %self.active, key, "duplicate key ignored");
            return;
        }
        section_entry(&mut self.sections, &self.active).replace(key, value);
    }
}
