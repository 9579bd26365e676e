use crate::datadeps::LegalityError;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single schedule transformation.
///
/// Loops are named by the loop variables of the tree the transformation is applied
/// to; computations by their program names.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum Transformation {
    Tile { dim: String, factor: u32 },
    Interchange { first: String, second: String },
    Fuse { first: String, second: String, dim: String },
    Unroll { dim: String, factor: u32 },
    Parallelize { dim: String },
    Vectorize { dim: String, factor: u32 },
}

/// An ordered list of [Transformation]s, as applied to an initial tree.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct Schedule(pub Vec<Transformation>);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("no loop named `{0}`")]
    UnknownLoop(String),
    #[error("no computation named `{0}`")]
    UnknownComputation(String),
    #[error("`{transformation}` does not apply: {reason}")]
    NotApplicable {
        transformation: String,
        reason: String,
    },
    #[error("illegal schedule: {0}")]
    Illegal(#[from] LegalityError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ScheduleParseError {
    pub line: usize,
    pub message: String,
}

impl Transformation {
    pub fn keyword(&self) -> &'static str {
        match self {
            Transformation::Tile { .. } => "tile",
            Transformation::Interchange { .. } => "interchange",
            Transformation::Fuse { .. } => "fuse",
            Transformation::Unroll { .. } => "unroll",
            Transformation::Parallelize { .. } => "parallelize",
            Transformation::Vectorize { .. } => "vectorize",
        }
    }

    pub(crate) fn not_applicable(&self, reason: impl Into<String>) -> ApplyError {
        ApplyError::NotApplicable {
            transformation: self.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kw = self.keyword();
        match self {
            Transformation::Tile { dim, factor }
            | Transformation::Unroll { dim, factor }
            | Transformation::Vectorize { dim, factor } => write!(f, "{kw} {dim} {factor}"),
            Transformation::Interchange { first, second } => write!(f, "{kw} {first} {second}"),
            Transformation::Fuse { first, second, dim } => {
                write!(f, "{kw} {first} {second} {dim}")
            }
            Transformation::Parallelize { dim } => write!(f, "{kw} {dim}"),
        }
    }
}

impl FromStr for Transformation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words = s.split_whitespace().collect::<Vec<_>>();
        let Some((&kw, args)) = words.split_first() else {
            return Err("empty transformation".to_owned());
        };
        let expect_args = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(format!("`{kw}` takes {n} arguments, got {}", args.len()))
            }
        };
        let factor = |w: &str| {
            w.parse::<u32>()
                .map_err(|_| format!("`{w}` is not a valid factor"))
        };
        match kw {
            "tile" | "unroll" | "vectorize" => {
                expect_args(2)?;
                let dim = args[0].to_owned();
                let factor = factor(args[1])?;
                Ok(match kw {
                    "tile" => Transformation::Tile { dim, factor },
                    "unroll" => Transformation::Unroll { dim, factor },
                    _ => Transformation::Vectorize { dim, factor },
                })
            }
            "interchange" => {
                expect_args(2)?;
                Ok(Transformation::Interchange {
                    first: args[0].to_owned(),
                    second: args[1].to_owned(),
                })
            }
            "fuse" => {
                expect_args(3)?;
                Ok(Transformation::Fuse {
                    first: args[0].to_owned(),
                    second: args[1].to_owned(),
                    dim: args[2].to_owned(),
                })
            }
            "parallelize" => {
                expect_args(1)?;
                Ok(Transformation::Parallelize {
                    dim: args[0].to_owned(),
                })
            }
            _ => Err(format!("unknown transformation `{kw}`")),
        }
    }
}

impl Schedule {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transformation> + '_ {
        self.0.iter()
    }
}

/// One transformation per line.
impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for t in &self.0 {
            writeln!(f, "{t}")?;
        }
        Ok(())
    }
}

/// Parses one transformation per line. Blank lines and `#` comments are skipped.
impl FromStr for Schedule {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut transformations = vec![];
        for (idx, raw_line) in s.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let t = line.parse().map_err(|message| ScheduleParseError {
                line: idx + 1,
                message,
            })?;
            transformations.push(t);
        }
        Ok(Schedule(transformations))
    }
}

impl FromIterator<Transformation> for Schedule {
    fn from_iter<I: IntoIterator<Item = Transformation>>(iter: I) -> Self {
        Schedule(iter.into_iter().collect())
    }
}
