//! Shared identifiers and submission types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifier of one course-generation job
    JobId
);
uuid_id!(
    /// Identifier of one unit record (superseding units get fresh ids)
    UnitId
);
uuid_id!(
    /// Identifier of one regeneration request
    RegenerationId
);

/// Opaque handle to content produced by an executor. The engine never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(String);

impl ResultRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ResultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Priority level for jobs and their units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3, // User-initiated regeneration
}

impl Priority {
    /// One level up, saturating at `Urgent`.
    pub fn boosted(self) -> Self {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Urgent => Priority::Urgent,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Learner proficiency the course targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProficiencyLevel {
    Beginner,
    Intermediate,
    Advanced,
}

/// Course specification. Opaque to the engine beyond sizing the content fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseSpec {
    pub course_id: String,
    pub title: String,
    pub domain: String,
    pub proficiency: ProficiencyLevel,
    /// Target chapter count; structure output must match it
    pub chapter_count: usize,
}

impl CourseSpec {
    pub fn new(course_id: impl Into<String>, domain: impl Into<String>, chapter_count: usize) -> Self {
        let domain = domain.into();
        Self {
            course_id: course_id.into(),
            title: format!("Introduction to {domain}"),
            domain,
            proficiency: ProficiencyLevel::Beginner,
            chapter_count,
        }
    }

    pub fn validate(&self, max_chapters: usize) -> Result<(), String> {
        if self.course_id.trim().is_empty() {
            return Err("course_id cannot be empty".to_string());
        }
        if self.domain.trim().is_empty() {
            return Err("domain cannot be empty".to_string());
        }
        if self.chapter_count == 0 {
            return Err("chapter_count must be at least 1".to_string());
        }
        if self.chapter_count > max_chapters {
            return Err(format!(
                "chapter_count {} exceeds the maximum of {}",
                self.chapter_count, max_chapters
            ));
        }
        Ok(())
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub priority: Priority,
    /// On cancel, finish as `Degraded` instead of `Failed` when chapters exist.
    /// `None` falls back to the engine default.
    pub allow_partial: Option<bool>,
}
