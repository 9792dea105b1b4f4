use std::collections::HashMap;

use diesel::{
    dsl::{IntoBoxed, LeftJoin},
    pg::Pg,
    prelude::*,
    sql_types::Text,
    PgConnection,
};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::File;
use crate::pagination::{Page, PageMeta, PageOptions, SortOrder, PAGINATION_KEYS};
use crate::policy::{ActingUser, Role};
use crate::schema::{files, grades, schools, subjects};

use super::view::{load_file_views, FileView, ViewDepth};

diesel::define_sql_function!(fn unaccent(value: Text) -> Text);

type FileSource =
    LeftJoin<LeftJoin<files::table, LeftJoin<subjects::table, grades::table>>, schools::table>;
type BoxedFileQuery<'a> = IntoBoxed<'a, FileSource, Pg>;

/// Which level of the tree a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentScope {
    #[default]
    TopLevel,
    ChildrenOf(i32),
}

/// One user-supplied filter with its comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldFilter {
    SchoolId(i32),
    FiletypeId(i32),
    TopicId(i32),
    SubjectId(i32),
    CreatedBy(i32),
    GradeId(i32),
    Name(String),
}

#[derive(Debug, Clone, Copy)]
enum FilterKey {
    Parent,
    School,
    Filetype,
    Topic,
    Subject,
    CreatedBy,
    Grade,
    Name,
}

impl FilterKey {
    fn lookup(key: &str) -> Option<Self> {
        let key = match key {
            "parent_id" | "parentId" => Self::Parent,
            "schoolId" | "school_id" => Self::School,
            "filetypeId" | "filetype_id" | "fileTypeId" => Self::Filetype,
            "topicId" | "topic_id" => Self::Topic,
            "subjectId" | "subject_id" => Self::Subject,
            "createdBy" | "created_by" => Self::CreatedBy,
            "gradeId" | "grade_id" => Self::Grade,
            "name" => Self::Name,
            _ => return None,
        };
        Some(key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFilters {
    pub parent: ParentScope,
    pub fields: Vec<FieldFilter>,
}

impl FileFilters {
    /// Parses every non-pagination key of `query`. Unknown keys and
    /// non-numeric ids are rejected; blank values are ignored.
    pub fn from_query(query: &HashMap<String, String>) -> AppResult<Self> {
        let mut filters = FileFilters::default();

        let mut keys: Vec<&String> = query
            .keys()
            .filter(|key| !PAGINATION_KEYS.contains(&key.as_str()))
            .collect();
        keys.sort();

        for key in keys {
            let kind = FilterKey::lookup(key)
                .ok_or_else(|| AppError::bad_request(format!("unknown filter `{key}`")))?;
            let value = query[key].trim();

            match kind {
                FilterKey::Parent => {
                    if !value.is_empty() && value != "null" {
                        filters.parent = ParentScope::ChildrenOf(parse_id(key, value)?);
                    }
                }
                _ if value.is_empty() => {}
                FilterKey::Name => filters.fields.push(FieldFilter::Name(value.to_owned())),
                _ => {
                    let id = parse_id(key, value)?;
                    filters.fields.push(match kind {
                        FilterKey::School => FieldFilter::SchoolId(id),
                        FilterKey::Filetype => FieldFilter::FiletypeId(id),
                        FilterKey::Topic => FieldFilter::TopicId(id),
                        FilterKey::Subject => FieldFilter::SubjectId(id),
                        FilterKey::CreatedBy => FieldFilter::CreatedBy(id),
                        _ => FieldFilter::GradeId(id),
                    });
                }
            }
        }

        Ok(filters)
    }
}

fn parse_id(key: &str, value: &str) -> AppResult<i32> {
    value
        .parse::<i32>()
        .map_err(|_| AppError::bad_request(format!("`{key}` must be an integer")))
}

/// Wraps `term` for a substring `ILIKE`, escaping the pattern metacharacters.
pub fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn base_query<'a>() -> BoxedFileQuery<'a> {
    files::table
        .left_join(subjects::table.left_join(grades::table))
        .left_join(schools::table)
        .into_boxed()
}

fn scope_to_user<'a>(query: BoxedFileQuery<'a>, user: &ActingUser) -> BoxedFileQuery<'a> {
    match user.role {
        Some(Role::Teacher) if !user.subject_ids.is_empty() => query.filter(
            files::subject_id
                .eq_any(user.subject_ids.clone())
                .or(files::created_by.eq(user.id)),
        ),
        Some(Role::Principal) => {
            let shared = schools::is_admin
                .eq(true)
                .and(schools::school_type.eq_any(user.compatible_school_types()));
            match user.school.as_ref() {
                Some(school) => query.filter(files::school_id.eq(school.id).or(shared)),
                None => query.filter(shared),
            }
        }
        Some(Role::Admin) => {
            query.filter(schools::school_type.eq_any(user.compatible_school_types()))
        }
        _ => query.filter(files::created_by.eq(user.id)),
    }
}

fn apply_field<'a>(query: BoxedFileQuery<'a>, field: &FieldFilter) -> BoxedFileQuery<'a> {
    match field {
        FieldFilter::SchoolId(id) => query.filter(files::school_id.eq(*id)),
        FieldFilter::FiletypeId(id) => query.filter(files::filetype_id.eq(*id)),
        FieldFilter::TopicId(id) => query.filter(files::topic_id.eq(*id)),
        FieldFilter::SubjectId(id) => query.filter(files::subject_id.eq(*id)),
        FieldFilter::CreatedBy(id) => query.filter(files::created_by.eq(*id)),
        FieldFilter::GradeId(id) => query.filter(grades::id.eq(*id)),
        FieldFilter::Name(name) => query.filter(files::name.eq(name.clone())),
    }
}

fn filtered_query<'a>(
    options: &PageOptions,
    filters: &FileFilters,
    user: Option<&ActingUser>,
) -> BoxedFileQuery<'a> {
    let mut query = base_query();

    if let Some(user) = user {
        query = scope_to_user(query, user);
    }

    for field in &filters.fields {
        query = apply_field(query, field);
    }

    query = match filters.parent {
        ParentScope::TopLevel => query.filter(files::parent_id.is_null()),
        ParentScope::ChildrenOf(parent_id) => query.filter(files::parent_id.eq(parent_id)),
    };

    if let Some(search) = options.search.as_deref() {
        query = query.filter(unaccent(files::name).ilike(unaccent(like_pattern(search))));
    }

    query
}

pub fn find_all(
    conn: &mut PgConnection,
    options: &PageOptions,
    filters: &FileFilters,
    user: Option<&ActingUser>,
) -> AppResult<Page<FileView>> {
    let item_count: i64 = filtered_query(options, filters, user)
        .count()
        .get_result(conn)?;

    let rows_query = filtered_query(options, filters, user).select(File::as_select());
    let rows_query = match options.order {
        SortOrder::Asc => rows_query.order((files::created_at.asc(), files::id.asc())),
        SortOrder::Desc => rows_query.order((files::created_at.desc(), files::id.desc())),
    };
    let rows: Vec<File> = rows_query
        .offset(options.skip())
        .limit(options.take)
        .load(conn)?;

    debug!(
        item_count,
        returned = rows.len(),
        page = options.page,
        "listed files"
    );

    let data = load_file_views(conn, rows, ViewDepth::Listing)?;
    Ok(Page {
        data,
        meta: PageMeta::new(options, item_count),
    })
}
