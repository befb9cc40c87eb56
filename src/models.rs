use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};

/// Categories offered by the admin course form.
pub const COURSE_CATEGORIES: [&str; 6] = [
    "Frontend",
    "Backend",
    "Programming",
    "Data Science",
    "Mobile",
    "DevOps",
];

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[serde_as]
        #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(#[serde_as(as = "PickFirst<(_, DisplayFromStr)>")] pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }
    };
}

resource_id!(
    /// Identifier of a course in the remote store.
    CourseId
);
resource_id!(
    /// Identifier of a lesson, unique within its course.
    LessonId
);
resource_id!(
    /// Identifier of a user in the remote store.
    UserId
);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Difficulty {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Beginner" => Ok(Self::Beginner),
            "Intermediate" => Ok(Self::Intermediate),
            "Advanced" => Ok(Self::Advanced),
            other => Err(other.to_owned()),
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: CourseId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub duration: String,
    // the admin form historically stored prices as strings
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub instructor: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default)]
    pub students: u64,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
}

impl Course {
    pub fn lesson(&self, id: LessonId) -> Option<&Lesson> {
        self.lessons.iter().find(|l| l.id == id)
    }

    pub fn has_lesson(&self, id: LessonId) -> bool {
        self.lesson(id).is_some()
    }

    pub fn lesson_ids(&self) -> BTreeSet<LessonId> {
        self.lessons.iter().map(|l| l.id).collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: LessonId,
    pub title: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub video_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub completed: bool,
}

/// Account role. Anything the store holds other than `admin` is a standard learner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    Standard(String),
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::Standard("student".into())
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        if s == "admin" {
            Self::Admin
        } else {
            Self::Standard(s)
        }
    }
}

impl From<Role> for String {
    fn from(r: Role) -> Self {
        match r {
            Role::Admin => "admin".into(),
            Role::Standard(s) => s,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    // read for login checks only; never written back or rendered
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub enrolled_courses: BTreeSet<CourseId>,
    #[serde(default)]
    pub completed_lessons: Completion,
}

/// Body used to register a user.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    pub enrolled_courses: BTreeSet<CourseId>,
    pub completed_lessons: Completion,
}

const UNSCOPED_KEY: &str = "unscoped";

/// Completed lessons, keyed by the course that owns them.
///
/// Older records hold a flat array of lesson ids. Those land in `unscoped`
/// and are moved under a course by [`Completion::adopt`] once the course's
/// lesson list is known.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(from = "CompletionRepr", into = "CompletionRepr")]
pub struct Completion {
    scoped: BTreeMap<CourseId, BTreeSet<LessonId>>,
    unscoped: BTreeSet<LessonId>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CompletionRepr {
    Scoped(BTreeMap<String, BTreeSet<LessonId>>),
    Flat(BTreeSet<LessonId>),
}

impl From<CompletionRepr> for Completion {
    fn from(repr: CompletionRepr) -> Self {
        match repr {
            CompletionRepr::Flat(unscoped) => Self {
                scoped: BTreeMap::new(),
                unscoped,
            },
            CompletionRepr::Scoped(map) => {
                let mut out = Self::default();
                for (key, ids) in map {
                    if key == UNSCOPED_KEY {
                        out.unscoped.extend(ids);
                    } else if let Ok(course) = key.parse::<CourseId>() {
                        out.scoped.entry(course).or_default().extend(ids);
                    } else {
                        tracing::warn!(key = %key, "dropping completion entry with unknown key");
                    }
                }
                out
            }
        }
    }
}

impl From<Completion> for CompletionRepr {
    fn from(c: Completion) -> Self {
        let mut map: BTreeMap<String, BTreeSet<LessonId>> = c
            .scoped
            .into_iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(course, ids)| (course.to_string(), ids))
            .collect();
        if !c.unscoped.is_empty() {
            map.insert(UNSCOPED_KEY.into(), c.unscoped);
        }
        Self::Scoped(map)
    }
}

impl Completion {
    /// Lessons of `course` recorded as complete, including legacy unscoped ids
    /// that belong to it.
    pub fn for_course(&self, course: &Course) -> BTreeSet<LessonId> {
        let mut out = self.scoped.get(&course.id).cloned().unwrap_or_default();
        out.extend(self.unscoped.iter().copied().filter(|id| course.has_lesson(*id)));
        out
    }

    /// Move legacy unscoped ids that belong to `course` under its scope.
    /// Returns whether anything moved.
    pub fn adopt(&mut self, course: &Course) -> bool {
        let owned: Vec<LessonId> = self
            .unscoped
            .iter()
            .copied()
            .filter(|id| course.has_lesson(*id))
            .collect();
        if owned.is_empty() {
            return false;
        }
        let scope = self.scoped.entry(course.id).or_default();
        for id in owned {
            self.unscoped.remove(&id);
            scope.insert(id);
        }
        true
    }

    pub fn contains(&self, course: CourseId, lesson: LessonId) -> bool {
        self.scoped.get(&course).is_some_and(|ids| ids.contains(&lesson))
    }

    /// Flip `lesson` in `course`'s scope. Returns true when it is now complete.
    pub fn toggle(&mut self, course: CourseId, lesson: LessonId) -> bool {
        let scope = self.scoped.entry(course).or_default();
        if scope.remove(&lesson) {
            if scope.is_empty() {
                self.scoped.remove(&course);
            }
            false
        } else {
            scope.insert(lesson);
            true
        }
    }

    pub fn scoped(&self, course: CourseId) -> Option<&BTreeSet<LessonId>> {
        self.scoped.get(&course)
    }

    pub fn unscoped(&self) -> &BTreeSet<LessonId> {
        &self.unscoped
    }

    pub fn is_empty(&self) -> bool {
        self.scoped.values().all(BTreeSet::is_empty) && self.unscoped.is_empty()
    }
}
