//! Course management for admins.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, ResourceKind, RestClient};
use crate::models::{Course, CourseId, Difficulty, Lesson, LessonId};
use crate::session::Session;

pub const DEFAULT_RATING: f64 = 4.5;

pub const NEW_LESSON_DURATION: &str = "25:00";
pub const NEW_LESSON_VIDEO_URL: &str = "https://www.youtube.com/embed/dQw4w9WgXcQ";
pub const NEW_LESSON_DESCRIPTION: &str = "New lesson description";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DraftError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("price must be a non-negative number")]
    Price,
    #[error("rating must be between 0 and 5")]
    Rating,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("sign in required")]
    Unauthenticated,
    #[error("admin role required")]
    Forbidden,
    #[error(transparent)]
    Invalid(#[from] DraftError),
    #[error("deletion of course {0} was not confirmed")]
    NotConfirmed(CourseId),
    #[error("course {course} kept changing; gave up after {attempts} attempts")]
    Conflict { course: CourseId, attempts: u32 },
    #[error(transparent)]
    Remote(#[from] ApiError),
}

impl AdminError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Remote(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Course fields accepted from the admin form.
///
/// `lessons`, `students` and `rating` are normally left unset; an update then
/// keeps the stored values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CourseDraft {
    pub title: String,
    pub description: String,
    pub category: String,
    pub difficulty: Difficulty,
    pub duration: String,
    pub price: f64,
    pub instructor: String,
    pub thumbnail: String,
    #[serde(default)]
    pub lessons: Option<Vec<Lesson>>,
    #[serde(default)]
    pub students: Option<u64>,
    #[serde(default)]
    pub rating: Option<f64>,
}

impl CourseDraft {
    pub fn validate(&self) -> Result<(), DraftError> {
        let text = [
            ("title", &self.title),
            ("description", &self.description),
            ("category", &self.category),
            ("duration", &self.duration),
            ("instructor", &self.instructor),
            ("thumbnail", &self.thumbnail),
        ];
        if let Some((name, _)) = text.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(DraftError::Missing(*name));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(DraftError::Price);
        }
        if let Some(r) = self.rating {
            if !(0.0..=5.0).contains(&r) {
                return Err(DraftError::Rating);
            }
        }
        Ok(())
    }

    /// Apply the draft over `existing`, keeping its id and, unless the draft
    /// sets them, its lessons, student count and rating.
    pub fn merge_into(self, existing: Course) -> Course {
        Course {
            id: existing.id,
            title: self.title.trim().to_owned(),
            description: self.description.trim().to_owned(),
            category: self.category,
            difficulty: self.difficulty,
            duration: self.duration.trim().to_owned(),
            price: self.price,
            instructor: self.instructor.trim().to_owned(),
            thumbnail: self.thumbnail.trim().to_owned(),
            rating: Some(self.rating.or(existing.rating).unwrap_or(DEFAULT_RATING)),
            students: self.students.unwrap_or(existing.students),
            lessons: self.lessons.unwrap_or(existing.lessons),
        }
    }
}

/// Body posted to create a course; the store assigns the id.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewCourse<'a> {
    title: &'a str,
    description: &'a str,
    category: &'a str,
    difficulty: Difficulty,
    duration: &'a str,
    price: f64,
    instructor: &'a str,
    thumbnail: &'a str,
    lessons: &'a [Lesson],
    students: u64,
    rating: f64,
}

impl<'a> From<&'a CourseDraft> for NewCourse<'a> {
    fn from(d: &'a CourseDraft) -> Self {
        Self {
            title: d.title.trim(),
            description: d.description.trim(),
            category: &d.category,
            difficulty: d.difficulty,
            duration: d.duration.trim(),
            price: d.price,
            instructor: d.instructor.trim(),
            thumbnail: d.thumbnail.trim(),
            lessons: d.lessons.as_deref().unwrap_or_default(),
            students: d.students.unwrap_or(0),
            rating: d.rating.unwrap_or(DEFAULT_RATING),
        }
    }
}

/// Explicit answer to "delete this course?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

impl Confirmation {
    pub fn from_form(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("yes") | Some("true") | Some("on") => Self::Confirmed,
            _ => Self::Declined,
        }
    }
}

/// Lesson appended by [`CourseEditor::add_lesson`]: next free id in the
/// course, placeholder media and description.
pub fn new_lesson(course: &Course, title: &str) -> Lesson {
    let next = course.lessons.iter().map(|l| l.id.0).max().map_or(1, |m| m + 1);
    Lesson {
        id: LessonId(next),
        title: title.trim().to_owned(),
        duration: NEW_LESSON_DURATION.into(),
        video_url: NEW_LESSON_VIDEO_URL.into(),
        description: NEW_LESSON_DESCRIPTION.into(),
        completed: false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminStats {
    pub total_courses: usize,
    pub total_students: u64,
    pub total_lessons: usize,
    pub total_revenue: f64,
}

pub fn admin_stats(courses: &[Course]) -> AdminStats {
    AdminStats {
        total_courses: courses.len(),
        total_students: courses.iter().map(|c| c.students).sum(),
        total_lessons: courses.iter().map(|c| c.lessons.len()).sum(),
        total_revenue: courses.iter().map(|c| c.price).sum(),
    }
}

fn authorize(session: Option<&Session>) -> Result<&Session, AdminError> {
    match session {
        None => Err(AdminError::Unauthenticated),
        Some(s) if s.is_admin() => Ok(s),
        Some(s) => {
            tracing::warn!(user = %s.user.id, "non-admin attempted course management");
            Err(AdminError::Forbidden)
        }
    }
}

#[derive(Clone)]
pub struct CourseEditor {
    client: RestClient,
    append_retries: u32,
}

impl CourseEditor {
    pub fn new(client: RestClient, append_retries: u32) -> Self {
        Self {
            client,
            append_retries,
        }
    }

    pub async fn list(
        &self,
        session: Option<&Session>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Course>, AdminError> {
        authorize(session)?;
        Ok(self.client.list(ResourceKind::Courses, cancel).await?)
    }

    /// Create a course from `draft` and return the refreshed listing.
    pub async fn create(
        &self,
        session: Option<&Session>,
        draft: &CourseDraft,
        cancel: &CancellationToken,
    ) -> Result<Vec<Course>, AdminError> {
        let admin = authorize(session)?;
        draft.validate()?;
        let created: Course = self
            .client
            .create(ResourceKind::Courses, &NewCourse::from(draft), cancel)
            .await?;
        tracing::info!(admin = %admin.user.id, course = %created.id, "course created");
        self.list(session, cancel).await
    }

    /// Replace course `id` with `draft` merged over the stored record.
    pub async fn update(
        &self,
        session: Option<&Session>,
        id: CourseId,
        draft: CourseDraft,
        cancel: &CancellationToken,
    ) -> Result<Vec<Course>, AdminError> {
        let admin = authorize(session)?;
        draft.validate()?;
        let existing = self.client.get_versioned::<Course>(ResourceKind::Courses, id, cancel).await?;
        let updated = draft.merge_into(existing.value);
        let _: Course = self
            .client
            .replace(
                ResourceKind::Courses,
                id,
                &updated,
                existing.etag.as_deref(),
                cancel,
            )
            .await?;
        tracing::info!(admin = %admin.user.id, course = %id, "course updated");
        self.list(session, cancel).await
    }

    pub async fn delete(
        &self,
        session: Option<&Session>,
        id: CourseId,
        confirmation: Confirmation,
        cancel: &CancellationToken,
    ) -> Result<Vec<Course>, AdminError> {
        let admin = authorize(session)?;
        if confirmation != Confirmation::Confirmed {
            return Err(AdminError::NotConfirmed(id));
        }
        self.client.delete(ResourceKind::Courses, id, cancel).await?;
        tracing::info!(admin = %admin.user.id, course = %id, "course deleted");
        self.list(session, cancel).await
    }

    /// Append a lesson titled `title` to course `id`.
    ///
    /// Read-modify-write guarded by the store's ETag: when the course changes
    /// between the read and the write, the append is redone on the fresh
    /// record, up to the configured number of retries.
    pub async fn add_lesson(
        &self,
        session: Option<&Session>,
        id: CourseId,
        title: &str,
        cancel: &CancellationToken,
    ) -> Result<Lesson, AdminError> {
        let admin = authorize(session)?;
        if title.trim().is_empty() {
            return Err(DraftError::Missing("title").into());
        }
        let attempts = self.append_retries + 1;
        for attempt in 1..=attempts {
            let current = self.client.get_versioned::<Course>(ResourceKind::Courses, id, cancel).await?;
            let mut course = current.value;
            let lesson = new_lesson(&course, title);
            course.lessons.push(lesson.clone());
            let res: Result<Course, ApiError> = self
                .client
                .replace(ResourceKind::Courses, id, &course, current.etag.as_deref(), cancel)
                .await;
            match res {
                Ok(_) => {
                    tracing::info!(admin = %admin.user.id, course = %id, lesson = %lesson.id, "lesson added");
                    return Ok(lesson);
                }
                Err(ApiError::Conflict { .. }) => {
                    tracing::debug!(course = %id, attempt, "course changed during lesson append");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AdminError::Conflict {
            course: id,
            attempts,
        })
    }
}
