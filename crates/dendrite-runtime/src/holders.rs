//! Stream holders for model I/O.
//!
//! Holders are keyed by file name (empty string means stdin/stdout) and
//! owned by the simulator; they are torn down, flushing pending values, when
//! the simulation finishes. `Drop` covers abnormal exits.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};

use chrono::{DateTime, NaiveDate};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::matrix::{parse_matrix_text, Matrix, MatrixSparse};

/// Registry of open holders, keyed by file name.
#[derive(Default)]
pub struct Holders {
    inputs: IndexMap<String, InputHolder>,
    outputs: IndexMap<String, OutputHolder>,
    matrices: IndexMap<String, Matrix<f64>>,
}

impl Holders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing input holder, or open one. `time` and `smooth` apply only
    /// at first open.
    pub fn get_input(&mut self, name: &str, time: bool, smooth: bool) -> Result<&mut InputHolder> {
        if !self.inputs.contains_key(name) {
            let holder = InputHolder::open(name, time, smooth)?;
            self.inputs.insert(name.to_string(), holder);
        }
        Ok(self.inputs.get_mut(name).unwrap())
    }

    /// Existing output holder, or open one.
    pub fn get_output(&mut self, name: &str) -> Result<&mut OutputHolder> {
        if !self.outputs.contains_key(name) {
            let holder = OutputHolder::open(name)?;
            self.outputs.insert(name.to_string(), holder);
        }
        Ok(self.outputs.get_mut(name).unwrap())
    }

    /// Dense matrix loaded from a file, cached. A missing or ill-formed
    /// file degrades to a 1x1 zero with a report on stderr.
    pub fn get_matrix(&mut self, name: &str) -> &Matrix<f64> {
        if !self.matrices.contains_key(name) {
            let matrix = match std::fs::read_to_string(name) {
                Ok(text) => parse_matrix_text(name, &text),
                Err(e) => {
                    warn!(file = name, error = %e, "missing input file");
                    eprintln!("missing input file '{name}': {e}");
                    Matrix::new(1, 1)
                }
            };
            self.matrices.insert(name.to_string(), matrix);
        }
        &self.matrices[name]
    }

    /// Sparse view of a matrix file, for matrix-driven connections.
    pub fn get_matrix_sparse(&mut self, name: &str) -> MatrixSparse<f64> {
        let dense = self.get_matrix(name);
        let mut sparse = MatrixSparse::new();
        for r in 0..dense.rows() {
            for c in 0..dense.cols() {
                let v = dense.get(r, c);
                if v != 0.0 {
                    sparse.set(r, c, v);
                }
            }
        }
        sparse
    }

    /// Flush all outputs. Called at finish; Drop covers abnormal paths.
    pub fn flush(&mut self) {
        for output in self.outputs.values_mut() {
            output.flush();
        }
    }
}

/// One data row of an input stream.
#[derive(Debug, Clone, Default)]
struct Row {
    time: f64,
    values: Vec<f64>,
}

enum Source {
    File(BufReader<File>),
    Stdin(io::Stdin),
}

impl Source {
    fn read_line(&mut self, buffer: &mut String) -> io::Result<usize> {
        match self {
            Source::File(r) => r.read_line(buffer),
            Source::Stdin(r) => r.lock().read_line(buffer),
        }
    }
}

/// Streaming reader for delimited numeric series.
pub struct InputHolder {
    file_name: String,
    source: Source,
    delimiter: Option<char>,
    headers: Vec<String>,
    time_column: Option<usize>,
    time_mode: bool,
    smooth: bool,
    /// Row at or before the requested time.
    current: Option<Row>,
    /// Lookahead row after the requested time.
    next: Option<Row>,
    row_count: usize,
}

impl InputHolder {
    /// Open a file, or stdin for the empty name.
    pub fn open(name: &str, time_mode: bool, smooth: bool) -> Result<Self> {
        let source = if name.is_empty() {
            Source::Stdin(io::stdin())
        } else {
            let file = File::open(name).map_err(|_| Error::MissingInput(name.to_string()))?;
            Source::File(BufReader::new(file))
        };
        Ok(Self {
            file_name: name.to_string(),
            source,
            delimiter: None,
            headers: Vec::new(),
            time_column: None,
            time_mode,
            // Smoothing only makes sense against a time column.
            smooth: smooth && time_mode,
            current: None,
            next: None,
            row_count: 0,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Resolve a header name to a column position.
    pub fn column(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == header)
    }

    /// Value of `column` at time `t`, advancing the stream as needed.
    ///
    /// In smooth mode the result is linearly interpolated between the
    /// surrounding rows.
    pub fn get(&mut self, t: f64, column: usize) -> f64 {
        self.advance(t);
        let current = match &self.current {
            Some(row) => row,
            None => return 0.0,
        };
        let a = current.values.get(column).copied().unwrap_or(0.0);
        if self.smooth {
            if let Some(next) = &self.next {
                let b = next.values.get(column).copied().unwrap_or(0.0);
                let span = next.time - current.time;
                if span > 0.0 && t > current.time {
                    let blend = ((t - current.time) / span).min(1.0);
                    return a + (b - a) * blend;
                }
            }
        }
        a
    }

    /// Advance so that `current` is the last row with `row.time <= t`.
    fn advance(&mut self, t: f64) {
        if !self.time_mode {
            // Each query consumes one row.
            if let Some(row) = self.read_row() {
                self.current = Some(row);
            }
            return;
        }
        loop {
            if self.next.is_none() {
                self.next = self.read_row();
            }
            match &self.next {
                Some(next) if next.time <= t || self.current.is_none() => {
                    self.current = self.next.take();
                }
                _ => break,
            }
        }
    }

    /// Read and parse the next data row, learning delimiter, headers, and
    /// time column from the leading lines.
    fn read_row(&mut self) -> Option<Row> {
        loop {
            let mut line = String::new();
            let n = self.source.read_line(&mut line).ok()?;
            if n == 0 {
                return None;
            }
            let line = line.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }
            if self.delimiter.is_none() {
                self.delimiter = Some(detect_delimiter(line));
            }
            let delimiter = self.delimiter.unwrap();
            let fields: Vec<&str> = line.split(delimiter).collect();

            let numeric = fields
                .iter()
                .all(|f| f.trim().is_empty() || parse_field(f.trim()).is_some());
            if !numeric && self.headers.is_empty() {
                self.headers = fields.iter().map(|f| f.trim().to_string()).collect();
                if self.time_mode {
                    self.time_column = choose_time_column(&self.headers);
                }
                continue;
            }

            let values: Vec<f64> = fields
                .iter()
                .map(|f| parse_field(f.trim()).unwrap_or(f64::NAN))
                .collect();
            let time_column = self.time_column.unwrap_or(0);
            let time = if self.time_mode {
                values.get(time_column).copied().unwrap_or(0.0)
            } else {
                self.row_count as f64
            };
            self.row_count += 1;
            return Some(Row { time, values });
        }
    }
}

/// Delimiter precedence: tab > comma > space. Space counts only when the
/// line has a non-space character and neither tab nor comma appears.
fn detect_delimiter(line: &str) -> char {
    if line.contains('\t') {
        '\t'
    } else if line.contains(',') {
        ','
    } else {
        ' '
    }
}

/// Numeric field, or an ISO-8601 date converted to Unix time.
fn parse_field(field: &str) -> Option<f64> {
    if let Ok(v) = field.parse::<f64>() {
        return Some(v);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(field) {
        return Some(dt.timestamp() as f64);
    }
    if let Ok(date) = NaiveDate::parse_from_str(field, "%Y-%m-%d") {
        let dt = date.and_hms_opt(0, 0, 0)?;
        return Some(dt.and_utc().timestamp() as f64);
    }
    None
}

/// Header-match precedence for the time column.
fn choose_time_column(headers: &[String]) -> Option<usize> {
    for exact in ["$t", "time", "date", "t"] {
        if let Some(i) = headers.iter().position(|h| h == exact) {
            return Some(i);
        }
    }
    headers
        .iter()
        .position(|h| h.to_lowercase().contains("time"))
}

enum Sink {
    File(BufWriter<File>),
    Stdout,
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::File(w) => w.write(buf),
            Sink::Stdout => io::stdout().write(buf),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::File(w) => w.flush(),
            Sink::Stdout => io::stdout().flush(),
        }
    }
}

/// Tab-separated trace writer with `$t` as column 0.
///
/// Columns appear in first-use order. A sibling `.columns` file records
/// per-column mode strings for file-backed outputs.
pub struct OutputHolder {
    file_name: String,
    sink: Sink,
    columns: IndexMap<String, usize>,
    modes: Vec<Vec<(String, String)>>,
    row: Vec<f64>,
    current_time: Option<f64>,
}

impl OutputHolder {
    pub fn open(name: &str) -> Result<Self> {
        let sink = if name.is_empty() {
            Sink::Stdout
        } else {
            Sink::File(BufWriter::new(File::create(name)?))
        };
        let mut holder = Self {
            file_name: name.to_string(),
            sink,
            columns: IndexMap::new(),
            modes: Vec::new(),
            row: Vec::new(),
            current_time: None,
        };
        holder.register_column("$t", "");
        Ok(holder)
    }

    fn register_column(&mut self, header: &str, mode: &str) -> usize {
        if let Some(&i) = self.columns.get(header) {
            return i;
        }
        let index = self.columns.len();
        self.columns.insert(header.to_string(), index);
        self.modes.push(parse_mode(mode));
        self.row.push(f64::NAN);
        index
    }

    /// Record `value` under `column` at time `now`.
    ///
    /// A change of `now` closes the pending row.
    pub fn trace(&mut self, now: f64, column: &str, value: f64, mode: &str) {
        if let Some(t) = self.current_time {
            if t != now {
                self.write_row();
            }
        }
        self.current_time = Some(now);
        let index = self.register_column(column, mode);
        self.row[0] = now;
        self.row[index] = value;
    }

    fn write_row(&mut self) {
        if self.current_time.is_none() {
            return;
        }
        let mut line = String::new();
        for (i, value) in self.row.iter().enumerate() {
            if i > 0 {
                line.push('\t');
            }
            // NaN means "no value this row" and prints blank.
            if !value.is_nan() {
                line.push_str(&format_value(*value));
            }
        }
        line.push('\n');
        let _ = self.sink.write_all(line.as_bytes());
        for value in self.row.iter_mut() {
            *value = f64::NAN;
        }
    }

    /// Close the pending row and push everything to the sink.
    pub fn flush(&mut self) {
        self.write_row();
        self.current_time = None;
        let _ = self.sink.flush();
        self.write_columns_file();
    }

    fn write_columns_file(&mut self) {
        if self.file_name.is_empty() {
            return;
        }
        let path = format!("{}.columns", self.file_name);
        let mut text = String::from("N2A.schema=3\n");
        for (header, &index) in &self.columns {
            text.push_str(&format!("{index}:{header}\n"));
            for (key, value) in &self.modes[index] {
                text.push_str(&format!(" {key}:{value}\n"));
            }
        }
        if let Err(e) = std::fs::write(&path, text) {
            warn!(file = path, error = %e, "failed to write columns file");
        }
    }
}

impl Drop for OutputHolder {
    fn drop(&mut self) {
        debug!(file = %self.file_name, "closing output holder");
        self.flush();
    }
}

fn parse_mode(mode: &str) -> Vec<(String, String)> {
    mode.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            match pair.split_once('=') {
                Some((k, v)) => Some((k.to_string(), v.to_string())),
                None => Some((pair.to_string(), String::new())),
            }
        })
        .collect()
}

fn format_value(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn delimiter_precedence() {
        assert_eq!(detect_delimiter("a\tb,c"), '\t');
        assert_eq!(detect_delimiter("a,b c"), ',');
        assert_eq!(detect_delimiter("a b"), ' ');
    }

    #[test]
    fn time_column_precedence() {
        let headers = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            choose_time_column(&headers(&["date", "time", "$t"])),
            Some(2)
        );
        assert_eq!(choose_time_column(&headers(&["x", "time"])), Some(1));
        assert_eq!(choose_time_column(&headers(&["x", "runtime_ms"])), Some(1));
        assert_eq!(choose_time_column(&headers(&["x", "y"])), None);
    }

    #[test]
    fn iso_dates_to_unix_time() {
        assert_eq!(parse_field("1970-01-02"), Some(86400.0));
        assert!(parse_field("not-a-date").is_none());
    }

    #[test]
    fn smooth_interpolation() {
        let f = write_temp("0,0\n1,10\n");
        let mut holder = InputHolder::open(f.path().to_str().unwrap(), true, true).unwrap();
        let v = holder.get(0.3, 1);
        assert!((v - 3.0).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn step_semantics_without_smooth() {
        let f = write_temp("0,0\n1,10\n");
        let mut holder = InputHolder::open(f.path().to_str().unwrap(), true, false).unwrap();
        assert_eq!(holder.get(0.3, 1), 0.0);
        assert_eq!(holder.get(1.5, 1), 10.0);
    }

    #[test]
    fn header_line_detected() {
        let f = write_temp("time\tv\n0\t5\n1\t7\n");
        let mut holder = InputHolder::open(f.path().to_str().unwrap(), true, false).unwrap();
        assert_eq!(holder.get(0.0, 1), 5.0);
        assert_eq!(holder.column("v"), Some(1));
    }

    #[test]
    fn output_round_trip_through_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let path_str = path.to_str().unwrap().to_string();
        {
            let mut out = OutputHolder::open(&path_str).unwrap();
            out.trace(0.0, "x", 1.0, "");
            out.trace(0.1, "x", 2.0, "");
            out.trace(0.2, "x", 3.0, "");
            out.flush();
        }
        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "0\t1\n0.1\t2\n0.2\t3\n");

        let mut input = InputHolder::open(&path_str, true, false).unwrap();
        assert_eq!(input.get(0.1, 1), 2.0);
    }

    #[test]
    fn nan_prints_blank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let path_str = path.to_str().unwrap().to_string();
        {
            let mut out = OutputHolder::open(&path_str).unwrap();
            out.trace(0.0, "a", 1.0, "");
            out.trace(0.0, "b", 2.0, "");
            out.trace(0.1, "b", 4.0, "");
            out.flush();
        }
        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "0\t1\t2\n0.1\t\t4\n");
    }

    #[test]
    fn columns_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let path_str = path.to_str().unwrap().to_string();
        {
            let mut out = OutputHolder::open(&path_str).unwrap();
            out.trace(0.0, "V", 1.0, "ymin=0,ymax=10");
            out.flush();
        }
        let mut content = String::new();
        File::open(dir.path().join("out.columns"))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert!(content.starts_with("N2A.schema=3\n"));
        assert!(content.contains("0:$t\n"));
        assert!(content.contains("1:V\n ymin:0\n ymax:10\n"));
    }

    #[test]
    fn missing_matrix_degrades() {
        let mut holders = Holders::new();
        let m = holders.get_matrix("/nonexistent/file/xyz");
        assert_eq!((m.rows(), m.cols()), (1, 1));
    }
}
