//! Delimited-text pattern files.
//!
//! One pattern per line: `input_width` input values, then the output values,
//! then (optionally) a label column. Blank lines and lines starting with `#`
//! are skipped; fields may be quoted and are trimmed.
//!
//! ```text
//! # x0, x1, target
//! 0, 1, 1
//! 1, 1, 0
//! ```

use csv::{ReaderBuilder, StringRecord, Trim};
use ndarray::Array1;
use std::fs;
use std::path::Path;

use super::{Pattern, PatternSource};
use crate::error::{NetError, NetResult};

/// Column layout of a pattern file.
#[derive(Debug, Clone, PartialEq)]
pub struct DelimitedFormat {
    /// Single ASCII field separator. A whitespace delimiter also accepts runs of
    /// itself, so aligned columns parse.
    pub delimiter: char,
    pub input_width: usize,
    /// Whether the last column is a label rather than an output value.
    pub labelled: bool,
}

impl DelimitedFormat {
    pub fn csv(input_width: usize) -> Self {
        Self {
            delimiter: ',',
            input_width,
            labelled: false,
        }
    }
}

/// Parse pattern lines; `path` is only used in error messages.
///
/// Every line must carry the same number of output values as the first one.
/// Lines holding only whitespace are skipped.
///
/// # Errors
/// `MalformedPatterns` with the 1-based line number of the first bad line;
/// `InvalidConfig` for a delimiter that is not ASCII.
pub fn parse_patterns(text: &str, format: &DelimitedFormat, path: &Path) -> NetResult<Vec<Pattern>> {
    if !format.delimiter.is_ascii() {
        return Err(NetError::InvalidConfig(format!(
            "pattern delimiter `{}` is not a single ASCII character",
            format.delimiter
        )));
    }
    let runs = format.delimiter.is_ascii_whitespace();

    let mut reader = ReaderBuilder::new()
        .delimiter(format.delimiter as u8)
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(Trim::All)
        // Field counts are checked below, per line.
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut lines = LineIndex::new(text);
    let mut patterns = Vec::new();
    let mut record = StringRecord::new();
    let mut output_width = None;

    loop {
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                let line = err.position().map_or(0, |p| lines.line_at(p.byte()));
                return Err(NetError::MalformedPatterns {
                    path: path.to_path_buf(),
                    line,
                    reason: err.to_string(),
                });
            }
        }
        if record.iter().all(str::is_empty) {
            continue;
        }
        let line = record.position().map_or(0, |p| lines.line_at(p.byte()));
        let bad = |reason: String| NetError::MalformedPatterns {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut fields: Vec<&str> = record.iter().filter(|f| !(runs && f.is_empty())).collect();
        let label = if format.labelled {
            fields.pop().map(str::to_string)
        } else {
            None
        };

        let values = fields
            .iter()
            .map(|f| {
                f.parse::<f64>()
                    .map_err(|_| bad(format!("`{f}` is not a number")))
            })
            .collect::<NetResult<Vec<f64>>>()?;
        if values.len() <= format.input_width {
            return Err(bad(format!(
                "{} values leave no outputs after {} inputs",
                values.len(),
                format.input_width
            )));
        }

        let outputs = values.len() - format.input_width;
        match output_width {
            None => output_width = Some(outputs),
            Some(w) if w != outputs => {
                return Err(bad(format!("{outputs} outputs where earlier lines had {w}")))
            }
            Some(_) => {}
        }

        let (input, output) = values.split_at(format.input_width);
        let mut pattern = Pattern::new(Array1::from(input.to_vec()), Array1::from(output.to_vec()));
        if let Some(label) = label {
            pattern = pattern.with_label(label);
        }
        patterns.push(pattern);
    }

    Ok(patterns)
}

/// Load a pattern file into a source named after the file stem.
///
/// # Errors
/// `Io` if the file cannot be read, otherwise see [`parse_patterns`].
pub fn load_patterns(path: &Path, format: &DelimitedFormat) -> NetResult<PatternSource> {
    let text = fs::read_to_string(path).map_err(|e| NetError::io(path, e))?;
    let patterns = parse_patterns(&text, format, path)?;

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("patterns")
        .to_string();

    Ok(PatternSource::from_patterns(name, patterns))
}

/// Maps record byte offsets to 1-based line numbers.
///
/// The reader may report a record at the start of the blank or comment lines it
/// skipped on the way; those are stepped over here. Queries must not go backwards.
struct LineIndex<'a> {
    text: &'a str,
    byte: usize,
    line: usize,
}

impl<'a> LineIndex<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            byte: 0,
            line: 1,
        }
    }

    fn line_at(&mut self, byte: u64) -> usize {
        let target = usize::try_from(byte)
            .unwrap_or(usize::MAX)
            .clamp(self.byte, self.text.len());
        self.line += self.text[self.byte..target].matches('\n').count();
        self.byte = target;

        loop {
            let rest = &self.text[self.byte..];
            let Some(end) = rest.find('\n') else {
                break;
            };
            let current = rest[..end].trim();
            if !current.is_empty() && !current.starts_with('#') {
                break;
            }
            self.byte += end + 1;
            self.line += 1;
        }
        self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::fs;

    #[test]
    fn test_parse_csv() {
        let text = "# xor\n0,0,0\n\n0, 1, 1\n1,0,1\n1,1,0\n";
        let patterns = parse_patterns(text, &DelimitedFormat::csv(2), Path::new("xor.csv")).unwrap();
        assert_eq!(patterns.len(), 4);
        assert_eq!(patterns[1].input(), array![0.0, 1.0]);
        assert_eq!(patterns[1].output(), array![1.0]);
        assert_eq!(patterns[1].label(), None);
    }

    #[test]
    fn test_parse_labelled_whitespace() {
        let format = DelimitedFormat {
            delimiter: ' ',
            input_width: 1,
            labelled: true,
        };
        let patterns = parse_patterns("0.5  1 0 up\n-0.5 0 1 down\n", &format, Path::new("t")).unwrap();
        assert_eq!(patterns[0].output(), array![1.0, 0.0]);
        assert_eq!(patterns[1].label(), Some("down"));
    }

    #[test]
    fn test_parse_quoted_fields() {
        let text = "\"0.5\",\"1\",\"0\"\n\"-1\", 2 ,\"3e-1\"\n";
        let patterns = parse_patterns(text, &DelimitedFormat::csv(2), Path::new("q.csv")).unwrap();
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].input(), array![0.5, 1.0]);
        assert_eq!(patterns[0].output(), array![0.0]);
        assert_eq!(patterns[1].input(), array![-1.0, 2.0]);
        assert_eq!(patterns[1].output(), array![0.3]);
    }

    #[test]
    fn test_rejects_non_ascii_delimiter() {
        let format = DelimitedFormat {
            delimiter: '§',
            input_width: 1,
            labelled: false,
        };
        let err = parse_patterns("1§2\n", &format, Path::new("p")).unwrap_err();
        assert!(matches!(err, NetError::InvalidConfig(_)));
    }

    #[test]
    fn test_bad_lines_report_line_numbers() {
        let format = DelimitedFormat::csv(2);
        let err = parse_patterns("0,0,1\n# c\n1,x,1\n", &format, Path::new("p")).unwrap_err();
        assert!(matches!(err, NetError::MalformedPatterns { line: 3, .. }));

        let err = parse_patterns("0,0\n", &format, Path::new("p")).unwrap_err();
        assert!(matches!(err, NetError::MalformedPatterns { line: 1, .. }));

        let err = parse_patterns("0,0,1\n0,0,1,1\n", &format, Path::new("p")).unwrap_err();
        assert!(matches!(err, NetError::MalformedPatterns { line: 2, .. }));
    }

    #[test]
    fn test_line_numbers_skip_comments_and_blanks() {
        let format = DelimitedFormat::csv(1);
        let text = "# header\n\n1,2\n\n# note\n   \n3,4\n5,oops\n";
        let err = parse_patterns(text, &format, Path::new("p")).unwrap_err();
        assert!(matches!(err, NetError::MalformedPatterns { line: 8, .. }));

        let err = parse_patterns("1,2\n\n\n3,4,5\n", &format, Path::new("p")).unwrap_err();
        assert!(matches!(err, NetError::MalformedPatterns { line: 4, .. }));
    }

    #[test]
    fn test_load_patterns_names_source() {
        let dir = std::env::temp_dir().join("nodenet_test_patterns");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("and.csv");
        fs::write(&path, "0,0,0\n1,1,1\n").unwrap();

        let source = load_patterns(&path, &DelimitedFormat::csv(2)).unwrap();
        assert_eq!(source.name(), "and");
        assert_eq!(source.len(), 2);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_patterns(Path::new("/nonexistent/p.csv"), &DelimitedFormat::csv(1));
        assert!(matches!(result, Err(NetError::Io { .. })));
    }
}
