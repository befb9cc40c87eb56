//! Page view models. Handlers build these from store data; nothing here
//! talks to the network.

use serde::Serialize;

use crate::admin::AdminStats;
use crate::models::{Course, CourseId, Difficulty, Lesson, LessonId, User, UserId};
use crate::progress::{CourseProgress, DashboardSummary};

/// Courses shown on the landing page.
pub const FEATURED_COURSES: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct Viewer {
    pub id: UserId,
    pub username: String,
    pub admin: bool,
}

impl From<&User> for Viewer {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            admin: u.role.is_admin(),
        }
    }
}

/// Course as listed in the catalog, without its lessons.
#[derive(Debug, Clone, Serialize)]
pub struct CourseCard {
    pub id: CourseId,
    pub title: String,
    pub description: String,
    pub category: String,
    pub difficulty: Difficulty,
    pub duration: String,
    pub price: f64,
    pub instructor: String,
    pub thumbnail: String,
    pub rating: Option<f64>,
    pub students: u64,
    pub lesson_count: usize,
}

impl From<&Course> for CourseCard {
    fn from(c: &Course) -> Self {
        Self {
            id: c.id,
            title: c.title.clone(),
            description: c.description.clone(),
            category: c.category.clone(),
            difficulty: c.difficulty,
            duration: c.duration.clone(),
            price: c.price,
            instructor: c.instructor.clone(),
            thumbnail: c.thumbnail.clone(),
            rating: c.rating,
            students: c.students,
            lesson_count: c.lessons.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Feature {
    pub title: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct HomePage {
    pub viewer: Option<Viewer>,
    pub featured: Vec<CourseCard>,
    pub features: Vec<Feature>,
}

pub fn home(viewer: Option<&User>, courses: &[Course]) -> HomePage {
    HomePage {
        viewer: viewer.map(Viewer::from),
        featured: courses.iter().take(FEATURED_COURSES).map(CourseCard::from).collect(),
        features: vec![
            Feature {
                title: "Expert Instructors",
                description: "Learn from industry professionals with real-world experience",
            },
            Feature {
                title: "Flexible Learning",
                description: "Study at your own pace with lifetime access to courses",
            },
            Feature {
                title: "Practical Projects",
                description: "Build real projects to enhance your portfolio",
            },
        ],
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogPage {
    pub search: String,
    pub category: String,
    pub categories: Vec<String>,
    pub courses: Vec<CourseCard>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LessonView {
    pub id: LessonId,
    pub position: usize,
    pub title: String,
    pub duration: String,
    pub description: String,
    /// Only present for enrolled viewers.
    pub video_url: Option<String>,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseDetailPage {
    pub viewer: Option<Viewer>,
    pub course: CourseCard,
    pub lessons: Vec<LessonView>,
    pub progress: CourseProgress,
}

pub fn course_detail(viewer: Option<&User>, course: &Course, progress: CourseProgress) -> CourseDetailPage {
    let lessons = course
        .lessons
        .iter()
        .enumerate()
        .map(|(i, l)| lesson_view(i + 1, l, &progress))
        .collect();
    CourseDetailPage {
        viewer: viewer.map(Viewer::from),
        course: CourseCard::from(course),
        lessons,
        progress,
    }
}

fn lesson_view(position: usize, lesson: &Lesson, progress: &CourseProgress) -> LessonView {
    LessonView {
        id: lesson.id,
        position,
        title: lesson.title.clone(),
        duration: lesson.duration.clone(),
        description: lesson.description.clone(),
        video_url: progress.enrolled.then(|| lesson.video_url.clone()),
        completed: progress.completed.contains(&lesson.id),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrolledCourse {
    pub course: CourseCard,
    pub progress: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardPage {
    pub viewer: Viewer,
    pub summary: DashboardSummary,
    pub courses: Vec<EnrolledCourse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminPage {
    pub viewer: Viewer,
    pub stats: AdminStats,
    pub categories: &'static [&'static str],
    pub courses: Vec<CourseCard>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub heading: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaticPage {
    pub title: &'static str,
    pub sections: Vec<Section>,
}

pub fn about() -> StaticPage {
    StaticPage {
        title: "About E-Learn Pro",
        sections: vec![
            Section {
                heading: "Our Mission",
                body: "Make practical, career-focused learning accessible worldwide.",
            },
            Section {
                heading: "Expert-Led",
                body: "Courses by industry professionals.",
            },
            Section {
                heading: "Flexible",
                body: "Learn at your own pace.",
            },
            Section {
                heading: "Career-Focused",
                body: "Skills that employers want.",
            },
        ],
    }
}

pub fn contact() -> StaticPage {
    StaticPage {
        title: "Get in Touch",
        sections: vec![
            Section {
                heading: "Email Us",
                body: "hello@elearnpro.com",
            },
            Section {
                heading: "Call Us",
                body: "+1 (555) 123-4567, Mon to Fri, 9am to 6pm",
            },
            Section {
                heading: "Visit Us",
                body: "123 Education Street, Tech City. Open for visits by appointment.",
            },
        ],
    }
}

pub fn privacy() -> StaticPage {
    StaticPage {
        title: "Privacy Policy",
        sections: vec![
            Section {
                heading: "Introduction",
                body: "We collect only what is needed to run your account: username, email and learning progress.",
            },
            Section {
                heading: "Manage Your Privacy",
                body: "You can request export or deletion of your data at any time.",
            },
            Section {
                heading: "Contact Us",
                body: "privacy@elearnpro.com",
            },
        ],
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FormPage {
    pub title: &'static str,
    pub fields: &'static [&'static str],
    pub next: Option<String>,
    pub viewer: Option<Viewer>,
}

pub fn login(next: Option<String>, viewer: Option<&User>) -> FormPage {
    FormPage {
        title: "Sign in",
        fields: &["username", "password"],
        next,
        viewer: viewer.map(Viewer::from),
    }
}

pub fn register(next: Option<String>, viewer: Option<&User>) -> FormPage {
    FormPage {
        title: "Create account",
        fields: &["username", "email", "password"],
        next,
        viewer: viewer.map(Viewer::from),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::course_progress;
    use serde_json::json;

    fn course() -> Course {
        serde_json::from_value(json!({
            "id": 2,
            "title": "Go",
            "lessons": [
                {"id": 1, "title": "A", "videoUrl": "https://v/1"},
                {"id": 2, "title": "B", "videoUrl": "https://v/2"}
            ]
        }))
        .expect("course")
    }

    #[test]
    fn media_is_hidden_from_visitors() {
        let c = course();
        let page = course_detail(None, &c, course_progress(None, &c));
        assert!(page.lessons.iter().all(|l| l.video_url.is_none()));
        assert_eq!(page.lessons[1].position, 2);
        assert_eq!(page.course.lesson_count, 2);
    }

    #[test]
    fn enrolled_viewer_sees_media_and_marks() {
        let c = course();
        let user: User = serde_json::from_value(json!({
            "id": 1, "username": "ada", "enrolledCourses": [2], "completedLessons": {"2": [2]}
        }))
        .expect("user");
        let page = course_detail(Some(&user), &c, course_progress(Some(&user), &c));
        assert_eq!(page.lessons[0].video_url.as_deref(), Some("https://v/1"));
        assert!(!page.lessons[0].completed);
        assert!(page.lessons[1].completed);
        assert_eq!(page.progress.percent, 50);
    }

    #[test]
    fn home_features_at_most_three_courses() {
        let courses: Vec<Course> = (1..=5)
            .map(|i| serde_json::from_value(json!({"id": i, "title": "C"})).expect("course"))
            .collect();
        assert_eq!(home(None, &courses).featured.len(), FEATURED_COURSES);
    }
}
