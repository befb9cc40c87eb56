use crate::models::Course;

/// Category selector value that matches every course.
pub const ALL_CATEGORIES: &str = "All";

/// Courses whose title or description contains `term` (case-insensitive) and
/// whose category equals `category`, unless `category` is [`ALL_CATEGORIES`].
pub fn filter_courses<'a>(courses: &'a [Course], term: &str, category: &str) -> Vec<&'a Course> {
    let needle = term.to_lowercase();
    courses
        .iter()
        .filter(|c| {
            c.title.to_lowercase().contains(&needle)
                || c.description.to_lowercase().contains(&needle)
        })
        .filter(|c| category == ALL_CATEGORIES || c.category == category)
        .collect()
}

/// Category picker entries: [`ALL_CATEGORIES`] first, then each distinct
/// category in the order it first appears.
pub fn categories(courses: &[Course]) -> Vec<String> {
    let mut out = vec![ALL_CATEGORIES.to_owned()];
    for c in courses {
        if !out.iter().any(|seen| *seen == c.category) {
            out.push(c.category.clone());
        }
    }
    out
}
