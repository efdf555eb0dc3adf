//! Destination-name templates.
//!
//! A template is literal text mixed with placeholders:
//!
//! - `${name}`: stem of the triggering file
//! - `${previousName}`: stem of the name produced by the previous action in
//!   the chain, or `${name}` for the first action
//! - `${extension}`: extension of the triggering file, without the dot
//! - a run of `#`: zero-padded counter whose width is the run length
//!
//! The rendered stem always receives the triggering file's extension, so
//! `${name}` reproduces the original file name and `file_###` applied to
//! `photo.png` yields `file_000.png`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error raised when a template string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown placeholder '${{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),

    #[error("template contains more than one counter run")]
    MultipleCounters,

    #[error("counter value {value} does not fit in {width} digits")]
    CounterOverflow { value: u64, width: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Name,
    PreviousName,
    Extension,
    Counter(usize),
}

/// Parsed destination-name template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    raw: String,
    segments: Vec<Segment>,
}

/// Inputs for rendering one destination name.
#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    /// Name of the file that triggered the action chain.
    pub original: &'a Path,
    /// Name produced by the previous action in the chain, if any.
    pub previous: Option<&'a Path>,
    /// Counter value to substitute; required when the template has a counter.
    pub counter: Option<u64>,
}

impl NameTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut counters = 0usize;
        let mut rest = raw;
        let mut offset = 0usize;

        while let Some(ch) = rest.chars().next() {
            if ch == '#' {
                let width = rest.chars().take_while(|c| *c == '#').count();
                counters += 1;
                if counters > 1 {
                    return Err(TemplateError::MultipleCounters);
                }
                flush_literal(&mut literal, &mut segments);
                segments.push(Segment::Counter(width));
                rest = &rest[width..];
                offset += width;
                continue;
            }

            if let Some(after) = rest.strip_prefix("${") {
                let Some(close) = after.find('}') else {
                    return Err(TemplateError::Unterminated(offset));
                };
                let segment = match &after[..close] {
                    "name" => Segment::Name,
                    "previousName" => Segment::PreviousName,
                    "extension" => Segment::Extension,
                    other => return Err(TemplateError::UnknownPlaceholder(other.to_string())),
                };
                flush_literal(&mut literal, &mut segments);
                segments.push(segment);
                let consumed = close + 3;
                rest = &rest[consumed..];
                offset += consumed;
                continue;
            }

            literal.push(ch);
            rest = &rest[ch.len_utf8()..];
            offset += ch.len_utf8();
        }
        flush_literal(&mut literal, &mut segments);

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The template text as written in the config.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Width of the counter run, if the template has one.
    pub fn counter_width(&self) -> Option<usize> {
        self.segments.iter().find_map(|segment| match segment {
            Segment::Counter(width) => Some(*width),
            _ => None,
        })
    }

    /// Render a file name (stem plus the original extension).
    pub fn render(&self, input: RenderInput<'_>) -> Result<String, TemplateError> {
        let original_stem = stem_of(input.original);
        let extension = extension_of(input.original);
        let previous_stem = input
            .previous
            .map(stem_of)
            .unwrap_or_else(|| original_stem.clone());

        let mut stem = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => stem.push_str(text),
                Segment::Name => stem.push_str(&original_stem),
                Segment::PreviousName => stem.push_str(&previous_stem),
                Segment::Extension => stem.push_str(&extension),
                Segment::Counter(width) => {
                    let value = input.counter.unwrap_or(0);
                    let rendered = format!("{value:0width$}", width = *width);
                    if rendered.len() > *width {
                        return Err(TemplateError::CounterOverflow {
                            value,
                            width: *width,
                        });
                    }
                    stem.push_str(&rendered);
                }
            }
        }

        if extension.is_empty() {
            Ok(stem)
        } else {
            Ok(format!("{stem}.{extension}"))
        }
    }

    /// Extract the counter value from a name rendered by this template.
    ///
    /// Returns `None` if the template has no counter or `name` does not
    /// have the literal shape around the counter.
    pub fn counter_in(&self, name: &str) -> Option<u64> {
        let width = self.counter_width()?;
        let mut prefix = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => prefix.push_str(text),
                Segment::Counter(_) => break,
                _ => return None,
            }
        }
        let digits = name.strip_prefix(&prefix)?.get(..width)?;
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

fn flush_literal(literal: &mut String, segments: &mut Vec<Segment>) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl FromStr for NameTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for NameTemplate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for NameTemplate {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn render(template: &str, original: &str, previous: Option<&str>, counter: Option<u64>) -> String {
        NameTemplate::parse(template)
            .unwrap()
            .render(RenderInput {
                original: Path::new(original),
                previous: previous.map(Path::new),
                counter,
            })
            .unwrap()
    }

    #[test]
    fn test_name_placeholder_reproduces_original() {
        assert_eq!(render("${name}", "myFile", None, None), "myFile");
        assert_eq!(render("${name}", "file3.forMove", None, None), "file3.forMove");
    }

    #[test]
    fn test_counter_is_zero_padded_and_keeps_extension() {
        assert_eq!(render("file_###", "photo.png", None, Some(7)), "file_007.png");
        assert_eq!(render("file_###", "file2_ą.ź", None, Some(1)), "file_001.ź");
    }

    #[test]
    fn test_previous_name_falls_back_to_name() {
        assert_eq!(render("${previousName}", "a.csv", None, None), "a.csv");
        assert_eq!(
            render("${previousName}", "a.csv", Some("file_003.csv"), None),
            "file_003.csv"
        );
    }

    #[test]
    fn test_extension_placeholder() {
        assert_eq!(render("${name}_${extension}", "report.txt", None, None), "report_txt.txt");
    }

    #[test]
    fn test_rejects_unknown_and_unterminated_placeholders() {
        assert_eq!(
            NameTemplate::parse("${nope}"),
            Err(TemplateError::UnknownPlaceholder("nope".to_string()))
        );
        assert_eq!(NameTemplate::parse("ab${name"), Err(TemplateError::Unterminated(2)));
    }

    #[test]
    fn test_rejects_second_counter_run() {
        assert_eq!(NameTemplate::parse("##_##"), Err(TemplateError::MultipleCounters));
    }

    #[test]
    fn test_counter_overflow_is_an_error() {
        let template = NameTemplate::parse("f_##").unwrap();
        assert_eq!(template.counter_width(), Some(2));
        let result = template.render(RenderInput {
            original: Path::new("a.txt"),
            previous: None,
            counter: Some(100),
        });
        assert_eq!(
            result,
            Err(TemplateError::CounterOverflow {
                value: 100,
                width: 2
            })
        );
    }

    #[test]
    fn test_counter_in_reads_back_value() {
        let template = NameTemplate::parse("file_###").unwrap();
        assert_eq!(template.counter_in("file_012.png"), Some(12));
        assert_eq!(template.counter_in("other_012.png"), None);
        assert_eq!(template.counter_in("file_ab1.png"), None);
        assert_eq!(NameTemplate::parse("${name}").unwrap().counter_in("x"), None);
    }

    #[test]
    fn test_serde_uses_raw_string() {
        let template: NameTemplate = serde_json::from_str("\"file_###\"").unwrap();
        assert_eq!(serde_json::to_string(&template).unwrap(), "\"file_###\"");
        assert!(serde_json::from_str::<NameTemplate>("\"${bad}\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_counter_round_trips_through_name(value in 0u64..1000, stem in "[a-z]{1,8}") {
            let template = NameTemplate::parse("file_###").unwrap();
            let name = template
                .render(RenderInput {
                    original: Path::new(&format!("{stem}.jpg")),
                    previous: None,
                    counter: Some(value),
                })
                .unwrap();
            prop_assert_eq!(name.len(), "file_000.jpg".len());
            prop_assert_eq!(template.counter_in(&name), Some(value));
        }
    }
}
