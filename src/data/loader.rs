// ============================================================
// Layer 4 - Dataset Loader
// ============================================================
// Loads text-to-SQL records by dataset identifier + split name.
//
// The identifier is resolved in this order:
//   1. An existing local file        → read it directly
//   2. An existing local directory   → read {dir}/{data_file}
//   3. Anything else ("owner/name")  → download {data_file} from
//                                      the HuggingFace hub dataset
//                                      repo with hf-hub, then read it
//
// Supported file layouts:
//   - a JSON array of objects            [ {...}, {...} ]
//   - JSON Lines, one object per line    {...}\n{...}\n
//
// The split name follows the hub slicing syntax:
//   train            every record
//   train[:1000]     first 1000 records
//   train[100:200]   records 100..200
//   train[:10%]      first 10% of records
//   train[50%:]      second half
//
// Reference: hf-hub crate documentation (sync API)
//            Rust Book §9 (Error Handling)

use anyhow::{anyhow, bail, Context, Result};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs,
    ops::Range,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::domain::record::SqlRecord;
use crate::domain::traits::RecordSource;

/// File fetched from hub dataset repos when no other name is given.
pub const DEFAULT_DATA_FILE: &str = "sql_create_context_v4.json";

// ─── SplitSpec ────────────────────────────────────────────────────────────────

/// One end of a split slice: an absolute record index or a percentage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SliceBound {
    Index(usize),
    Percent(f64),
}

impl SliceBound {
    fn resolve(self, total: usize) -> usize {
        match self {
            SliceBound::Index(i)   => i.min(total),
            SliceBound::Percent(p) => (((p / 100.0) * total as f64).round() as usize).min(total),
        }
    }
}

impl FromStr for SliceBound {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let p: f64 = pct.trim().parse()
                .with_context(|| format!("Invalid percentage '{s}' in split"))?;
            if !(0.0..=100.0).contains(&p) {
                bail!("Split percentage {p} is outside 0..=100");
            }
            Ok(SliceBound::Percent(p))
        } else {
            let i: usize = s.parse()
                .with_context(|| format!("Invalid index '{s}' in split"))?;
            Ok(SliceBound::Index(i))
        }
    }
}

/// A named split with an optional [start:end] slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSpec {
    pub name:  String,
    pub start: Option<SliceBound>,
    pub end:   Option<SliceBound>,
}

impl SplitSpec {
    pub fn whole(name: impl Into<String>) -> Self {
        Self { name: name.into(), start: None, end: None }
    }

    /// Range of record indices selected out of `total` records.
    /// An inverted slice selects nothing rather than failing.
    pub fn range(&self, total: usize) -> Range<usize> {
        let start = self.start.map_or(0, |b| b.resolve(total));
        let end   = self.end.map_or(total, |b| b.resolve(total));
        start..end.max(start)
    }
}

impl FromStr for SplitSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let Some(open) = s.find('[') else {
            if s.is_empty() {
                bail!("Split name must not be empty");
            }
            return Ok(SplitSpec::whole(s));
        };

        let name = s[..open].trim();
        if name.is_empty() {
            bail!("Split '{s}' has no name before '['");
        }
        let inner = s[open + 1..]
            .strip_suffix(']')
            .ok_or_else(|| anyhow!("Split '{s}' is missing a closing ']'"))?;
        let (lo, hi) = inner
            .split_once(':')
            .ok_or_else(|| anyhow!("Split slice '{inner}' must look like start:end"))?;

        let parse_bound = |b: &str| -> Result<Option<SliceBound>> {
            if b.trim().is_empty() { Ok(None) } else { Ok(Some(b.parse()?)) }
        };

        Ok(SplitSpec {
            name:  name.to_string(),
            start: parse_bound(lo)?,
            end:   parse_bound(hi)?,
        })
    }
}

impl fmt::Display for SplitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |b: &Option<SliceBound>| match b {
            None                          => String::new(),
            Some(SliceBound::Index(i))    => i.to_string(),
            Some(SliceBound::Percent(p))  => format!("{p}%"),
        };
        if self.start.is_none() && self.end.is_none() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}[{}:{}]", self.name, show(&self.start), show(&self.end))
        }
    }
}

// ─── DatasetSpec ──────────────────────────────────────────────────────────────

/// Which dataset to read and which part of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Local path or hub dataset identifier ("owner/name")
    pub id:        String,
    pub split:     SplitSpec,
    /// File inside a directory / hub repo holding the records
    pub data_file: String,
    /// Cap applied after slicing
    pub limit:     Option<usize>,
}

// ─── DatasetLoader ────────────────────────────────────────────────────────────

pub struct DatasetLoader {
    spec:  DatasetSpec,
    token: Option<String>,
}

impl DatasetLoader {
    pub fn new(spec: DatasetSpec) -> Self {
        Self { spec, token: None }
    }

    /// Credential forwarded to the hub for gated datasets.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Find the file holding the records, downloading it if needed.
    fn resolve_file(&self) -> Result<PathBuf> {
        let local = Path::new(&self.spec.id);
        if local.is_file() {
            return Ok(local.to_path_buf());
        }
        if local.is_dir() {
            let path = local.join(&self.spec.data_file);
            if !path.is_file() {
                bail!("Dataset directory '{}' has no '{}'", local.display(), self.spec.data_file);
            }
            return Ok(path);
        }

        tracing::info!(
            "Fetching '{}' from hub dataset '{}'",
            self.spec.data_file,
            self.spec.id
        );
        let api = ApiBuilder::new()
            .with_token(self.token.clone())
            .with_progress(false)
            .build()
            .context("Failed to initialise the HuggingFace hub client")?;
        let repo = api.repo(Repo::new(self.spec.id.clone(), RepoType::Dataset));
        repo.get(&self.spec.data_file).with_context(|| {
            format!(
                "Cannot download '{}' from dataset '{}'",
                self.spec.data_file, self.spec.id
            )
        })
    }
}

impl RecordSource for DatasetLoader {
    fn load_records(&self) -> Result<Vec<SqlRecord>> {
        let path = self.resolve_file()?;
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read dataset file '{}'", path.display()))?;

        let mut records = parse_records(&text)
            .with_context(|| format!("Malformed dataset file '{}'", path.display()))?;
        let total = records.len();

        let range = self.spec.split.range(total);
        records.truncate(range.end);
        records.drain(..range.start);
        if let Some(limit) = self.spec.limit {
            records.truncate(limit);
        }

        if records.is_empty() {
            bail!(
                "Split '{}' of '{}' selected no records ({} available)",
                self.spec.split, self.spec.id, total
            );
        }

        tracing::info!(
            "Loaded {} of {} records from '{}' split '{}'",
            records.len(),
            total,
            self.spec.id,
            self.spec.split
        );
        Ok(records)
    }
}

/// Parse either a JSON array or JSON Lines into records.
pub fn parse_records(text: &str) -> Result<Vec<SqlRecord>> {
    if text.trim_start().starts_with('[') {
        let values: Vec<serde_json::Value> = serde_json::from_str(text)
            .context("Invalid JSON array")?;
        return values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                serde_json::from_value(v).with_context(|| format!("Record {i} is not a valid row"))
            })
            .collect();
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Line {} is not a valid row", i + 1))
        })
        .collect()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn jsonl(n: usize) -> String {
        (0..n)
            .map(|i| format!(
                r#"{{"context":"CREATE TABLE t{i} (x INT)","question":"q{i}","answer":"SELECT x FROM t{i}"}}"#
            ))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_parse_split_forms() {
        assert_eq!("train".parse::<SplitSpec>().unwrap(), SplitSpec::whole("train"));

        let s: SplitSpec = "train[100:200]".parse().unwrap();
        assert_eq!(s.start, Some(SliceBound::Index(100)));
        assert_eq!(s.end,   Some(SliceBound::Index(200)));

        let s: SplitSpec = "train[:10%]".parse().unwrap();
        assert_eq!(s.start, None);
        assert_eq!(s.end,   Some(SliceBound::Percent(10.0)));
    }

    #[test]
    fn test_parse_split_errors() {
        assert!("".parse::<SplitSpec>().is_err());
        assert!("train[:10".parse::<SplitSpec>().is_err());
        assert!("train[10]".parse::<SplitSpec>().is_err());
        assert!("[:10]".parse::<SplitSpec>().is_err());
        assert!("train[:150%]".parse::<SplitSpec>().is_err());
        assert!("train[a:]".parse::<SplitSpec>().is_err());
    }

    #[test]
    fn test_split_ranges() {
        let total = 1000;
        assert_eq!("train".parse::<SplitSpec>().unwrap().range(total), 0..1000);
        assert_eq!("train[:10%]".parse::<SplitSpec>().unwrap().range(total), 0..100);
        assert_eq!("train[50%:]".parse::<SplitSpec>().unwrap().range(total), 500..1000);
        assert_eq!("train[10:5000]".parse::<SplitSpec>().unwrap().range(total), 10..1000);
        // Inverted slices select nothing
        assert_eq!("train[20:10]".parse::<SplitSpec>().unwrap().range(total), 20..20);
    }

    #[test]
    fn test_split_display_round_trips_syntax() {
        for s in ["train", "train[:1000]", "test[10%:90%]"] {
            assert_eq!(s.parse::<SplitSpec>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_parse_json_array_and_lines() {
        let arr = r#"[{"context":"c","question":"q","answer":"a"}]"#;
        assert_eq!(parse_records(arr).unwrap().len(), 1);

        let lines = format!("{}\n\n", jsonl(3));
        assert_eq!(parse_records(&lines).unwrap().len(), 3);
    }

    #[test]
    fn test_bad_line_is_reported() {
        let text = format!("{}\n{{\"context\":\"c\"}}", jsonl(2));
        let err  = parse_records(&text).unwrap_err();
        assert!(format!("{err:#}").contains("Line 3"));
    }

    #[test]
    fn test_load_local_file_with_slice_and_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", jsonl(20)).unwrap();

        let loader = DatasetLoader::new(DatasetSpec {
            id:        file.path().to_string_lossy().into_owned(),
            split:     "train[5:15]".parse().unwrap(),
            data_file: DEFAULT_DATA_FILE.to_string(),
            limit:     Some(4),
        });
        let records = loader.load_records().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].question, "q5");
        assert_eq!(records[3].question, "q8");
    }

    #[test]
    fn test_load_local_directory_uses_data_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("rows.jsonl"), jsonl(3)).unwrap();

        let loader = DatasetLoader::new(DatasetSpec {
            id:        dir.path().to_string_lossy().into_owned(),
            split:     SplitSpec::whole("train"),
            data_file: "rows.jsonl".to_string(),
            limit:     None,
        });
        assert_eq!(loader.load_records().unwrap().len(), 3);
    }

    #[test]
    fn test_empty_selection_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", jsonl(3)).unwrap();

        let loader = DatasetLoader::new(DatasetSpec {
            id:        file.path().to_string_lossy().into_owned(),
            split:     "train[3:]".parse().unwrap(),
            data_file: DEFAULT_DATA_FILE.to_string(),
            limit:     None,
        });
        assert!(loader.load_records().is_err());
    }
}
