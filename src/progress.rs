//! Enrollment and lesson completion.
//!
//! Mutations run one at a time per user: each takes the user's write lock,
//! starts from the cached user, persists to the store, and puts the cached
//! state back if the store rejects the write.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, ResourceKind, RestClient};
use crate::models::{Completion, Course, CourseId, LessonId, User};
use crate::session::{Session, SessionStore};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("lesson {lesson} does not belong to course {course}")]
    UnknownLesson { course: CourseId, lesson: LessonId },
    #[error(transparent)]
    Remote(#[from] ApiError),
}

impl ProgressError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnknownLesson { .. } => false,
            Self::Remote(e) => e.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Enrolled,
    AlreadyEnrolled,
    /// No identity; the caller should send the visitor to sign in.
    RedirectToLogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Changed { completed: bool, progress: u8 },
    /// Not enrolled (or not signed in); nothing changed.
    NotEnrolled,
}

pub fn is_enrolled(user: &User, course_id: CourseId) -> bool {
    user.enrolled_courses.contains(&course_id)
}

/// Percentage of `course`'s lessons present in `completed`, rounded half up.
pub fn compute_progress(course: &Course, completed: &BTreeSet<LessonId>) -> u8 {
    let total = course.lesson_ids();
    if total.is_empty() {
        return 0;
    }
    let done = total.intersection(completed).count();
    let (done, total) = (done as u64, total.len() as u64);
    // done <= total, so this stays within 0..=100
    ((200 * done + total) / (2 * total)) as u8
}

/// Completion state of one course as seen by one (possibly anonymous) viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseProgress {
    pub enrolled: bool,
    pub completed: BTreeSet<LessonId>,
    pub percent: u8,
}

pub fn course_progress(user: Option<&User>, course: &Course) -> CourseProgress {
    match user {
        Some(u) if is_enrolled(u, course.id) => {
            let completed = u.completed_lessons.for_course(course);
            let percent = compute_progress(course, &completed);
            CourseProgress {
                enrolled: true,
                completed,
                percent,
            }
        }
        _ => CourseProgress {
            enrolled: false,
            completed: BTreeSet::new(),
            percent: 0,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub enrolled_courses: usize,
    pub completed_lessons: usize,
    pub average_progress: u8,
}

/// Totals across the user's enrolled courses. Enrollments whose course is no
/// longer in `courses` are ignored.
pub fn dashboard_summary(user: &User, courses: &[Course]) -> DashboardSummary {
    let enrolled: Vec<&Course> = courses
        .iter()
        .filter(|c| is_enrolled(user, c.id))
        .collect();
    let mut completed_lessons = 0;
    let mut percent_sum: u64 = 0;
    for course in &enrolled {
        let done = user.completed_lessons.for_course(course);
        completed_lessons += done.len();
        percent_sum += u64::from(compute_progress(course, &done));
    }
    let average_progress = if enrolled.is_empty() {
        0
    } else {
        let n = enrolled.len() as u64;
        ((2 * percent_sum + n) / (2 * n)) as u8
    };
    DashboardSummary {
        enrolled_courses: enrolled.len(),
        completed_lessons,
        average_progress,
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnrollmentPatch<'a> {
    enrolled_courses: &'a BTreeSet<CourseId>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionPatch<'a> {
    completed_lessons: &'a Completion,
}

#[derive(Clone)]
pub struct ProgressTracker {
    client: RestClient,
    sessions: SessionStore,
}

impl ProgressTracker {
    pub fn new(client: RestClient, sessions: SessionStore) -> Self {
        Self { client, sessions }
    }

    /// Enroll the session's user in `course_id`.
    ///
    /// Without a session nothing is read or written and
    /// [`EnrollOutcome::RedirectToLogin`] is returned.
    pub async fn enroll(
        &self,
        session: Option<&mut Session>,
        course_id: CourseId,
        cancel: &CancellationToken,
    ) -> Result<EnrollOutcome, ProgressError> {
        let Some(session) = session else {
            return Ok(EnrollOutcome::RedirectToLogin);
        };
        let _writer = self.sessions.lock_user(session.user.id).await;
        self.sessions.reload(session);
        if is_enrolled(&session.user, course_id) {
            return Ok(EnrollOutcome::AlreadyEnrolled);
        }

        session.user.enrolled_courses.insert(course_id);
        let patch = EnrollmentPatch {
            enrolled_courses: &session.user.enrolled_courses,
        };
        let res: Result<User, ApiError> = self
            .client
            .patch(ResourceKind::Users, session.user.id, &patch, cancel)
            .await;
        match res {
            Ok(remote) => {
                session.user = remote;
                self.sessions.update(session);
                tracing::info!(user = %session.user.id, course = %course_id, "enrolled");
                Ok(EnrollOutcome::Enrolled)
            }
            Err(e) => {
                session.user.enrolled_courses.remove(&course_id);
                tracing::warn!(user = %session.user.id, course = %course_id, error = %e, "enroll failed");
                Err(e.into())
            }
        }
    }

    /// Flip completion of `lesson_id` within `course`.
    ///
    /// A no-op unless the session's user is enrolled in `course`. A failed
    /// write restores the completion state held before the call.
    pub async fn toggle_lesson_complete(
        &self,
        session: Option<&mut Session>,
        course: &Course,
        lesson_id: LessonId,
        cancel: &CancellationToken,
    ) -> Result<ToggleOutcome, ProgressError> {
        let Some(session) = session else {
            return Ok(ToggleOutcome::NotEnrolled);
        };
        let _writer = self.sessions.lock_user(session.user.id).await;
        self.sessions.reload(session);
        if !is_enrolled(&session.user, course.id) {
            return Ok(ToggleOutcome::NotEnrolled);
        }
        if !course.has_lesson(lesson_id) {
            return Err(ProgressError::UnknownLesson {
                course: course.id,
                lesson: lesson_id,
            });
        }

        let before = session.user.completed_lessons.clone();
        session.user.completed_lessons.adopt(course);
        let completed = session.user.completed_lessons.toggle(course.id, lesson_id);
        let patch = CompletionPatch {
            completed_lessons: &session.user.completed_lessons,
        };
        let res: Result<User, ApiError> = self
            .client
            .patch(ResourceKind::Users, session.user.id, &patch, cancel)
            .await;
        match res {
            Ok(remote) => {
                session.user = remote;
                self.sessions.update(session);
                let progress = course_progress(Some(&session.user), course).percent;
                tracing::debug!(course = %course.id, lesson = %lesson_id, completed, progress, "lesson toggled");
                Ok(ToggleOutcome::Changed {
                    completed,
                    progress,
                })
            }
            Err(e) => {
                session.user.completed_lessons = before;
                tracing::warn!(course = %course.id, lesson = %lesson_id, error = %e, "lesson toggle reverted");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn course(id: u64, lessons: &[u64]) -> Course {
        serde_json::from_value(json!({
            "id": id,
            "title": "Fixture",
            "lessons": lessons.iter().map(|l| json!({"id": l, "title": "L"})).collect::<Vec<_>>(),
        }))
        .expect("course")
    }

    fn user(enrolled: &[u64], completed: serde_json::Value) -> User {
        serde_json::from_value(json!({
            "id": 1,
            "username": "ada",
            "enrolledCourses": enrolled,
            "completedLessons": completed,
        }))
        .expect("user")
    }

    fn ids(ids: &[u64]) -> BTreeSet<LessonId> {
        ids.iter().copied().map(LessonId).collect()
    }

    #[test]
    fn empty_course_has_zero_progress() {
        let c = course(1, &[]);
        assert_eq!(compute_progress(&c, &ids(&[])), 0);
        assert_eq!(compute_progress(&c, &ids(&[1, 2, 3])), 0);
    }

    #[test]
    fn half_of_four_lessons_is_fifty() {
        let c = course(1, &[1, 2, 3, 4]);
        assert_eq!(compute_progress(&c, &ids(&[2, 4])), 50);
    }

    #[test]
    fn ids_from_other_courses_do_not_count() {
        let c = course(1, &[1, 2, 3, 4]);
        assert_eq!(compute_progress(&c, &ids(&[1, 90, 91, 92])), 25);
    }

    #[test]
    fn rounds_half_up() {
        let c = course(1, &[1, 2, 3]);
        assert_eq!(compute_progress(&c, &ids(&[1])), 33);
        assert_eq!(compute_progress(&c, &ids(&[1, 2])), 67);
        let c = course(1, &[1, 2, 3, 4, 5, 6, 7, 8]);
        // 12.5 -> 13
        assert_eq!(compute_progress(&c, &ids(&[1])), 13);
    }

    #[test]
    fn progress_never_decreases_as_lessons_complete() {
        let c = course(1, &[1, 2, 3, 4, 5, 6, 7]);
        let mut done = BTreeSet::new();
        let mut last = compute_progress(&c, &done);
        for id in [9, 3, 1, 3, 7, 2, 4, 5, 6] {
            done.insert(LessonId(id));
            let now = compute_progress(&c, &done);
            assert!(now >= last, "{now} < {last} after adding {id}");
            last = now;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn enrollment_lookup() {
        let u = user(&[2, 5], json!([]));
        assert!(is_enrolled(&u, CourseId(5)));
        assert!(!is_enrolled(&u, CourseId(3)));
    }

    #[test]
    fn anonymous_and_unenrolled_viewers_see_no_progress() {
        let c = course(3, &[1, 2]);
        assert!(!course_progress(None, &c).enrolled);
        let u = user(&[], json!({"3": [1]}));
        let p = course_progress(Some(&u), &c);
        assert!(!p.enrolled);
        assert_eq!(p.percent, 0);
    }

    #[test]
    fn dashboard_averages_enrolled_courses() {
        let courses = vec![course(1, &[1, 2]), course(2, &[10, 11, 12, 13]), course(3, &[20])];
        let u = user(&[1, 2, 99], json!({"1": [1, 2], "2": [10], "3": [20]}));
        let s = dashboard_summary(&u, &courses);
        assert_eq!(s.enrolled_courses, 2);
        assert_eq!(s.completed_lessons, 3);
        // (100 + 25) / 2 = 62.5
        assert_eq!(s.average_progress, 63);

        let nobody = user(&[], json!([]));
        assert_eq!(dashboard_summary(&nobody, &courses).average_progress, 0);
    }

    fn offline_tracker() -> ProgressTracker {
        // nothing listens here; these paths must not touch the network
        let client = RestClient::new("http://127.0.0.1:9", None).expect("client");
        ProgressTracker::new(client, SessionStore::new(chrono::Duration::hours(1)))
    }

    #[tokio::test]
    async fn enroll_without_session_only_redirects() {
        let tracker = offline_tracker();
        let cancel = CancellationToken::new();
        let outcome = tracker.enroll(None, CourseId(1), &cancel).await.expect("enroll");
        assert_eq!(outcome, EnrollOutcome::RedirectToLogin);
    }

    #[tokio::test]
    async fn toggle_outside_enrollment_is_a_no_op() {
        let tracker = offline_tracker();
        let cancel = CancellationToken::new();
        let c = course(3, &[1, 2]);
        let mut session = Session::new(user(&[4], json!({"4": [7]})));
        let before = session.user.clone();

        for _ in 0..2 {
            let outcome = tracker
                .toggle_lesson_complete(Some(&mut session), &c, LessonId(1), &cancel)
                .await
                .expect("toggle");
            assert_eq!(outcome, ToggleOutcome::NotEnrolled);
            assert_eq!(session.user, before);
        }
        let outcome = tracker
            .toggle_lesson_complete(None, &c, LessonId(1), &cancel)
            .await
            .expect("toggle");
        assert_eq!(outcome, ToggleOutcome::NotEnrolled);
    }

    #[tokio::test]
    async fn unknown_lesson_is_rejected_before_any_write() {
        let tracker = offline_tracker();
        let cancel = CancellationToken::new();
        let c = course(3, &[1, 2]);
        let mut session = Session::new(user(&[3], json!([])));
        let err = tracker
            .toggle_lesson_complete(Some(&mut session), &c, LessonId(42), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::UnknownLesson { .. }));
        assert!(session.user.completed_lessons.is_empty());
    }
}
