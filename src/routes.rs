use std::convert::Infallible;

use axum::{
    async_trait,
    extract::{Form, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::{headers::Cookie, TypedHeader};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::admin::{self, AdminError, Confirmation, CourseDraft, CourseEditor, DraftError};
use crate::api::{ApiError, ResourceKind, RestClient};
use crate::catalog::{self, ALL_CATEGORIES};
use crate::config::Config;
use crate::models::{Course, CourseId, Difficulty, Lesson, LessonId, COURSE_CATEGORIES};
use crate::progress::{self, EnrollOutcome, ProgressError, ProgressTracker, ToggleOutcome};
use crate::session::{Session, SessionError, SessionStore, SESSION_COOKIE};
use crate::views::{
    self, AdminPage, CatalogPage, CourseCard, CourseDetailPage, DashboardPage, EnrolledCourse,
    ErrorBody, FormPage, HomePage, Notice, Viewer,
};

#[derive(Clone)]
pub struct AppState {
    pub client: RestClient,
    pub sessions: SessionStore,
    pub tracker: ProgressTracker,
    pub editor: CourseEditor,
    /// Parent of every per-request token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(cfg: &Config, shutdown: CancellationToken) -> Result<Self, ApiError> {
        let client = RestClient::new(&cfg.api_base_url, cfg.api_timeout)?;
        let sessions = SessionStore::new(cfg.session_ttl);
        Ok(Self {
            tracker: ProgressTracker::new(client.clone(), sessions.clone()),
            editor: CourseEditor::new(client.clone(), cfg.lesson_append_retries),
            client,
            sessions,
            shutdown,
        })
    }
}

pub fn router(state: AppState, static_dir: &str) -> Router {
    Router::new()
        // catalog + learning
        .route("/", get(home))
        .route("/courses", get(course_catalog))
        .route("/courses/:id", get(course_detail))
        .route("/courses/:id/enroll", post(enroll))
        .route("/courses/:id/lessons/:lesson_id/toggle", post(toggle_lesson))
        .route("/dashboard", get(dashboard))
        // identity
        .route("/login", get(login_page).post(login))
        .route("/register", get(register_page).post(register))
        .route("/logout", post(logout))
        // static pages
        .route("/about", get(|| async { Json(views::about()) }))
        .route("/contact", get(|| async { Json(views::contact()) }).post(contact_submit))
        .route("/privacy", get(|| async { Json(views::privacy()) }))
        // admin
        .route("/admin", get(admin_panel))
        .route("/admin/courses", post(admin_create))
        .route("/admin/courses/:id", post(admin_update))
        .route("/admin/courses/:id/delete", post(admin_delete))
        .route("/admin/courses/:id/lessons", post(admin_add_lesson))
        .nest_service("/static", ServeDir::new(static_dir))
        .fallback(not_found)
        .with_state(state)
}

/// The signed-in session named by the `sid` cookie, if any.
pub struct CurrentSession(pub Option<Session>);

#[async_trait]
impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = TypedHeader::<Cookie>::from_request_parts(parts, state)
            .await
            .ok()
            .and_then(|TypedHeader(c)| c.get(SESSION_COOKIE).and_then(|v| v.parse::<Uuid>().ok()));
        Ok(Self(token.and_then(|t| state.sessions.get(t))))
    }
}

/// Cancellation scope of one request. Dropping the handler future (the
/// client went away) or shutting down cancels every store call made with
/// `token`.
struct RequestScope {
    token: CancellationToken,
    _guard: DropGuard,
}

impl RequestScope {
    fn new(state: &AppState) -> Self {
        let token = state.shutdown.child_token();
        Self {
            _guard: token.clone().drop_guard(),
            token,
        }
    }
}

// --- errors ---

#[derive(Debug)]
pub enum AppError {
    Redirect(String),
    BadRequest(String),
    NotFound,
    Api(ApiError),
    Progress(ProgressError),
    Admin(AdminError),
    Session(SessionError),
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        Self::Api(e)
    }
}

impl From<ProgressError> for AppError {
    fn from(e: ProgressError) -> Self {
        Self::Progress(e)
    }
}

impl From<AdminError> for AppError {
    fn from(e: AdminError) -> Self {
        Self::Admin(e)
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl From<DraftError> for AppError {
    fn from(e: DraftError) -> Self {
        Self::Admin(e.into())
    }
}

fn remote_status(e: &ApiError) -> StatusCode {
    match e {
        ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
        ApiError::Conflict { .. } => StatusCode::CONFLICT,
        ApiError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ApiError::Status(_) | ApiError::Http(_) | ApiError::Url(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, retryable) = match self {
            Self::Redirect(to) => return Redirect::to(&to).into_response(),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m, false),
            Self::NotFound => (StatusCode::NOT_FOUND, "page not found".to_owned(), false),
            Self::Api(e) => (remote_status(&e), e.to_string(), e.is_retryable()),
            Self::Progress(e) => {
                let status = match &e {
                    ProgressError::UnknownLesson { .. } => StatusCode::NOT_FOUND,
                    ProgressError::Remote(api) => remote_status(api),
                };
                (status, e.to_string(), e.is_retryable())
            }
            Self::Admin(AdminError::Unauthenticated) => {
                return Redirect::to(&login_redirect("/admin")).into_response()
            }
            Self::Admin(e) => {
                let status = match &e {
                    AdminError::Forbidden => StatusCode::FORBIDDEN,
                    AdminError::Invalid(_) | AdminError::NotConfirmed(_) => StatusCode::BAD_REQUEST,
                    AdminError::Conflict { .. } => StatusCode::CONFLICT,
                    AdminError::Remote(api) => remote_status(api),
                    AdminError::Unauthenticated => StatusCode::UNAUTHORIZED,
                };
                (status, e.to_string(), e.is_retryable())
            }
            Self::Session(e) => {
                let (status, retryable) = match &e {
                    SessionError::InvalidCredentials => (StatusCode::UNAUTHORIZED, false),
                    SessionError::UsernameTaken(_) => (StatusCode::CONFLICT, false),
                    SessionError::Missing(_) => (StatusCode::BAD_REQUEST, false),
                    SessionError::Remote(api) => (remote_status(api), api.is_retryable()),
                };
                (status, e.to_string(), retryable)
            }
        };
        if status.is_server_error() {
            tracing::error!(%status, error = %message, "request failed");
        } else {
            tracing::debug!(%status, error = %message, "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: message,
                retryable,
            }),
        )
            .into_response()
    }
}

// --- helpers ---

fn login_redirect(next: &str) -> String {
    format!("/login?next={}", utf8_percent_encode(next, NON_ALPHANUMERIC))
}

/// Only same-site absolute paths are honoured as post-login targets.
fn safe_next(next: Option<&str>) -> &str {
    match next {
        Some(n) if n.starts_with('/') && !n.starts_with("//") && !n.contains('\\') => n,
        _ => "/dashboard",
    }
}

fn session_cookie(token: Uuid) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax")
}

fn signed_in(session: &Session, next: Option<&str>) -> Response {
    (
        AppendHeaders([(header::SET_COOKIE, session_cookie(session.token))]),
        Redirect::to(safe_next(next)),
    )
        .into_response()
}

async fn load_course(st: &AppState, id: CourseId, cancel: &CancellationToken) -> Result<Course, AppError> {
    match st.client.get(ResourceKind::Courses, id, cancel).await {
        Ok(course) => Ok(course),
        Err(ApiError::NotFound { .. }) => {
            tracing::debug!(course = %id, "unknown course, back to catalog");
            Err(AppError::Redirect("/courses".into()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Pages read identity fresh from the store; a failed read keeps the cached copy.
async fn refresh_identity(st: &AppState, session: &mut Session, cancel: &CancellationToken) {
    if let Err(e) = st.sessions.refresh(&st.client, session, cancel).await {
        tracing::warn!(user = %session.user.id, error = %e, "using cached identity");
    }
}

// --- pages ---

async fn home(
    State(st): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<Json<HomePage>, AppError> {
    let scope = RequestScope::new(&st);
    let courses: Vec<Course> = st.client.list(ResourceKind::Courses, &scope.token).await?;
    Ok(Json(views::home(session.as_ref().map(|s| &s.user), &courses)))
}

#[derive(Deserialize, Default)]
struct CatalogQuery {
    #[serde(default)]
    search: String,
    category: Option<String>,
}

async fn course_catalog(
    State(st): State<AppState>,
    Query(q): Query<CatalogQuery>,
) -> Result<Json<CatalogPage>, AppError> {
    let scope = RequestScope::new(&st);
    let courses: Vec<Course> = st.client.list(ResourceKind::Courses, &scope.token).await?;
    let category = q
        .category
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| ALL_CATEGORIES.to_owned());
    let hits = catalog::filter_courses(&courses, &q.search, &category)
        .into_iter()
        .map(CourseCard::from)
        .collect();
    Ok(Json(CatalogPage {
        categories: catalog::categories(&courses),
        search: q.search,
        category,
        courses: hits,
    }))
}

async fn course_detail(
    State(st): State<AppState>,
    CurrentSession(mut session): CurrentSession,
    Path(id): Path<u64>,
) -> Result<Json<CourseDetailPage>, AppError> {
    let scope = RequestScope::new(&st);
    let course = load_course(&st, CourseId(id), &scope.token).await?;
    if let Some(s) = session.as_mut() {
        refresh_identity(&st, s, &scope.token).await;
    }
    let user = session.as_ref().map(|s| &s.user);
    let progress = progress::course_progress(user, &course);
    Ok(Json(views::course_detail(user, &course, progress)))
}

#[derive(Debug, Serialize)]
struct EnrollmentView {
    course: CourseId,
    enrolled: bool,
    newly_enrolled: bool,
}

async fn enroll(
    State(st): State<AppState>,
    CurrentSession(mut session): CurrentSession,
    Path(id): Path<u64>,
) -> Result<Json<EnrollmentView>, AppError> {
    let scope = RequestScope::new(&st);
    let course_id = CourseId(id);
    if session.is_some() {
        load_course(&st, course_id, &scope.token).await?;
    }
    match st.tracker.enroll(session.as_mut(), course_id, &scope.token).await? {
        EnrollOutcome::RedirectToLogin => Err(AppError::Redirect(login_redirect(&format!("/courses/{id}")))),
        outcome => Ok(Json(EnrollmentView {
            course: course_id,
            enrolled: true,
            newly_enrolled: outcome == EnrollOutcome::Enrolled,
        })),
    }
}

#[derive(Debug, Serialize)]
struct ToggleView {
    lesson: LessonId,
    changed: bool,
    completed: bool,
    progress: u8,
}

async fn toggle_lesson(
    State(st): State<AppState>,
    CurrentSession(mut session): CurrentSession,
    Path((id, lesson_id)): Path<(u64, u64)>,
) -> Result<Json<ToggleView>, AppError> {
    let scope = RequestScope::new(&st);
    let course = load_course(&st, CourseId(id), &scope.token).await?;
    let lesson = LessonId(lesson_id);
    let outcome = st
        .tracker
        .toggle_lesson_complete(session.as_mut(), &course, lesson, &scope.token)
        .await?;
    let view = match outcome {
        ToggleOutcome::Changed { completed, progress } => ToggleView {
            lesson,
            changed: true,
            completed,
            progress,
        },
        ToggleOutcome::NotEnrolled => ToggleView {
            lesson,
            changed: false,
            completed: false,
            progress: 0,
        },
    };
    Ok(Json(view))
}

async fn dashboard(
    State(st): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<Json<DashboardPage>, AppError> {
    let Some(mut session) = session else {
        return Err(AppError::Redirect(login_redirect("/dashboard")));
    };
    let scope = RequestScope::new(&st);
    refresh_identity(&st, &mut session, &scope.token).await;
    let courses: Vec<Course> = st.client.list(ResourceKind::Courses, &scope.token).await?;
    let user = &session.user;
    let enrolled = courses
        .iter()
        .filter(|c| progress::is_enrolled(user, c.id))
        .map(|c| EnrolledCourse {
            course: CourseCard::from(c),
            progress: progress::course_progress(Some(user), c).percent,
        })
        .collect();
    Ok(Json(DashboardPage {
        viewer: Viewer::from(user),
        summary: progress::dashboard_summary(user, &courses),
        courses: enrolled,
    }))
}

// --- identity ---

#[derive(Deserialize, Default)]
struct NextQuery {
    next: Option<String>,
}

async fn login_page(
    CurrentSession(session): CurrentSession,
    Query(q): Query<NextQuery>,
) -> Json<FormPage> {
    Json(views::login(q.next, session.as_ref().map(|s| &s.user)))
}

async fn register_page(
    CurrentSession(session): CurrentSession,
    Query(q): Query<NextQuery>,
) -> Json<FormPage> {
    Json(views::register(q.next, session.as_ref().map(|s| &s.user)))
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
    next: Option<String>,
}

async fn login(State(st): State<AppState>, Form(form): Form<LoginForm>) -> Result<Response, AppError> {
    let scope = RequestScope::new(&st);
    let session = st
        .sessions
        .login(&st.client, &form.username, &form.password, &scope.token)
        .await?;
    Ok(signed_in(&session, form.next.as_deref()))
}

#[derive(Deserialize)]
struct RegisterForm {
    username: String,
    email: String,
    password: String,
    next: Option<String>,
}

async fn register(State(st): State<AppState>, Form(form): Form<RegisterForm>) -> Result<Response, AppError> {
    let scope = RequestScope::new(&st);
    let session = st
        .sessions
        .register(&st.client, &form.username, &form.email, &form.password, &scope.token)
        .await?;
    Ok(signed_in(&session, form.next.as_deref()))
}

async fn logout(State(st): State<AppState>, CurrentSession(session): CurrentSession) -> Response {
    if let Some(s) = session {
        st.sessions.logout(s.token);
    }
    (
        AppendHeaders([(
            header::SET_COOKIE,
            format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Max-Age=0"),
        )]),
        Redirect::to("/"),
    )
        .into_response()
}

#[derive(Deserialize)]
struct ContactForm {
    name: String,
    email: String,
    #[serde(default)]
    subject: String,
    message: String,
}

async fn contact_submit(Form(form): Form<ContactForm>) -> Result<Json<Notice>, AppError> {
    for (field, value) in [("name", &form.name), ("email", &form.email), ("message", &form.message)] {
        if value.trim().is_empty() {
            return Err(AppError::BadRequest(format!("{field} is required")));
        }
    }
    if !form.email.contains('@') {
        return Err(AppError::BadRequest("email is invalid".into()));
    }
    tracing::info!(subject = %form.subject, "contact message received");
    Ok(Json(Notice {
        message: "Thank you for your message! We'll get back to you soon.".into(),
    }))
}

// --- admin ---

#[derive(Deserialize)]
struct CourseForm {
    title: String,
    description: String,
    category: String,
    difficulty: String,
    duration: String,
    price: String,
    instructor: String,
    thumbnail: String,
}

impl TryFrom<CourseForm> for CourseDraft {
    type Error = AppError;

    fn try_from(f: CourseForm) -> Result<Self, Self::Error> {
        let difficulty = f
            .difficulty
            .parse::<Difficulty>()
            .map_err(|d| AppError::BadRequest(format!("unknown difficulty {d:?}")))?;
        let price = f.price.trim().parse::<f64>().map_err(|_| DraftError::Price)?;
        Ok(Self {
            title: f.title,
            description: f.description,
            category: f.category,
            difficulty,
            duration: f.duration,
            price,
            instructor: f.instructor,
            thumbnail: f.thumbnail,
            lessons: None,
            students: None,
            rating: None,
        })
    }
}

fn course_cards(courses: &[Course]) -> Json<Vec<CourseCard>> {
    Json(courses.iter().map(CourseCard::from).collect())
}

async fn admin_panel(
    State(st): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<Json<AdminPage>, AppError> {
    let scope = RequestScope::new(&st);
    let courses = st.editor.list(session.as_ref(), &scope.token).await?;
    let Some(session) = session else {
        return Err(AdminError::Unauthenticated.into());
    };
    Ok(Json(AdminPage {
        viewer: Viewer::from(&session.user),
        stats: admin::admin_stats(&courses),
        categories: &COURSE_CATEGORIES,
        courses: courses.iter().map(CourseCard::from).collect(),
    }))
}

async fn admin_create(
    State(st): State<AppState>,
    CurrentSession(session): CurrentSession,
    Form(form): Form<CourseForm>,
) -> Result<Json<Vec<CourseCard>>, AppError> {
    let scope = RequestScope::new(&st);
    let draft = CourseDraft::try_from(form)?;
    let courses = st.editor.create(session.as_ref(), &draft, &scope.token).await?;
    Ok(course_cards(&courses))
}

async fn admin_update(
    State(st): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<u64>,
    Form(form): Form<CourseForm>,
) -> Result<Json<Vec<CourseCard>>, AppError> {
    let scope = RequestScope::new(&st);
    let draft = CourseDraft::try_from(form)?;
    let courses = st
        .editor
        .update(session.as_ref(), CourseId(id), draft, &scope.token)
        .await?;
    Ok(course_cards(&courses))
}

#[derive(Deserialize)]
struct DeleteForm {
    confirm: Option<String>,
}

async fn admin_delete(
    State(st): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<u64>,
    Form(form): Form<DeleteForm>,
) -> Result<Json<Vec<CourseCard>>, AppError> {
    let scope = RequestScope::new(&st);
    let confirmation = Confirmation::from_form(form.confirm.as_deref());
    let courses = st
        .editor
        .delete(session.as_ref(), CourseId(id), confirmation, &scope.token)
        .await?;
    Ok(course_cards(&courses))
}

#[derive(Deserialize)]
struct LessonForm {
    title: String,
}

async fn admin_add_lesson(
    State(st): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(id): Path<u64>,
    Form(form): Form<LessonForm>,
) -> Result<Json<Lesson>, AppError> {
    let scope = RequestScope::new(&st);
    let lesson = st
        .editor
        .add_lesson(session.as_ref(), CourseId(id), &form.title, &scope.token)
        .await?;
    Ok(Json(lesson))
}

async fn not_found() -> AppError {
    AppError::NotFound
}
