use chrono::Utc;
use diesel::{prelude::*, PgConnection};
use serde_json::Value;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::{File, NewFile, NewImage};
use crate::policy::ActingUser;
use crate::schema::{file_types, files, images, schools, subjects, topics};
use crate::utils::json::{classify_nullable, classify_nullable_id, NullableValue};

use super::removal::walk_subtree;
use super::view::{load_file_views, FileView, ViewDepth};

/// Width of the `files.name` column.
pub const MAX_NAME_LEN: usize = 255;

fn checked_name(value: &str) -> AppResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(AppError::bad_request(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Fields of a new file. Reference ids that do not resolve are stored as null.
#[derive(Debug, Clone, Default)]
pub struct CreateFile {
    pub name: String,
    pub path: Option<String>,
    pub filetype_id: Option<i32>,
    pub topic_id: Option<i32>,
    pub subject_id: Option<i32>,
    pub parent_id: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePatch {
    pub name: Option<String>,
    pub filetype_id: Option<Option<i32>>,
    pub topic_id: Option<Option<i32>>,
    pub subject_id: Option<Option<i32>>,
    pub parent_id: Option<Option<i32>>,
}

impl FilePatch {
    pub fn from_json(body: &Value) -> AppResult<Self> {
        if !body.is_object() {
            return Err(AppError::bad_request("expected a JSON object"));
        }

        let name = match classify_nullable(body.get("name")).map_err(AppError::bad_request)? {
            NullableValue::Omitted => None,
            NullableValue::Null => return Err(AppError::bad_request("name cannot be null")),
            NullableValue::Value(value) => Some(checked_name(&value)?),
        };

        let id_field = |primary: &str, alias: &str| -> AppResult<Option<Option<i32>>> {
            let value = body.get(primary).or_else(|| body.get(alias));
            classify_nullable_id(value)
                .map(NullableValue::into_change)
                .map_err(|err| AppError::bad_request(format!("{primary}: {err}")))
        };

        Ok(Self {
            name,
            filetype_id: id_field("filetypeId", "fileTypeId")?,
            topic_id: id_field("topicId", "topic_id")?,
            subject_id: id_field("subjectId", "subject_id")?,
            parent_id: id_field("parentId", "parent_id")?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self == &FilePatch::default()
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = files)]
struct FileChangeset<'a> {
    name: Option<&'a str>,
    filetype_id: Option<Option<i32>>,
    topic_id: Option<Option<i32>>,
    subject_id: Option<Option<i32>>,
    parent_id: Option<Option<i32>>,
}

fn resolve_filetype(conn: &mut PgConnection, id: Option<i32>) -> AppResult<Option<i32>> {
    match id {
        Some(id) => Ok(file_types::table
            .find(id)
            .select(file_types::id)
            .first(conn)
            .optional()?),
        None => Ok(None),
    }
}

fn resolve_topic(conn: &mut PgConnection, id: Option<i32>) -> AppResult<Option<i32>> {
    match id {
        Some(id) => Ok(topics::table
            .find(id)
            .select(topics::id)
            .first(conn)
            .optional()?),
        None => Ok(None),
    }
}

fn resolve_subject(conn: &mut PgConnection, id: Option<i32>) -> AppResult<Option<i32>> {
    match id {
        Some(id) => Ok(subjects::table
            .find(id)
            .select(subjects::id)
            .first(conn)
            .optional()?),
        None => Ok(None),
    }
}

fn resolve_school(conn: &mut PgConnection, id: Option<i32>) -> AppResult<Option<i32>> {
    match id {
        Some(id) => Ok(schools::table
            .find(id)
            .select(schools::id)
            .first(conn)
            .optional()?),
        None => Ok(None),
    }
}

fn resolve_parent(conn: &mut PgConnection, id: Option<i32>) -> AppResult<Option<i32>> {
    match id {
        Some(id) => Ok(files::table
            .find(id)
            .select(files::id)
            .first(conn)
            .optional()?),
        None => Ok(None),
    }
}

/// Persists a file owned by `user` together with one image row per entry
/// of `image_paths`, all named after the file.
pub fn create(
    conn: &mut PgConnection,
    dto: CreateFile,
    image_paths: Vec<String>,
    user: &ActingUser,
) -> AppResult<FileView> {
    let name = checked_name(&dto.name)?;

    let file = conn.transaction::<_, AppError, _>(|conn| {
        let new_file = NewFile {
            school_id: resolve_school(conn, user.school.as_ref().map(|school| school.id))?,
            filetype_id: resolve_filetype(conn, dto.filetype_id)?,
            topic_id: resolve_topic(conn, dto.topic_id)?,
            subject_id: resolve_subject(conn, dto.subject_id)?,
            parent_id: resolve_parent(conn, dto.parent_id)?,
            created_by: Some(user.id),
            path: dto.path.clone(),
            name: name.clone(),
        };

        let file: File = diesel::insert_into(files::table)
            .values(&new_file)
            .returning(File::as_returning())
            .get_result(conn)?;

        let new_images: Vec<NewImage> = image_paths
            .iter()
            .map(|path| NewImage {
                name: file.name.clone(),
                path: path.clone(),
                file_id: file.id,
            })
            .collect();
        if !new_images.is_empty() {
            diesel::insert_into(images::table)
                .values(&new_images)
                .execute(conn)?;
        }

        Ok(file)
    })?;

    info!(
        file_id = file.id,
        user_id = user.id,
        images = image_paths.len(),
        "file created"
    );

    single_view(conn, file, ViewDepth::Listing)
}

pub fn find_one(conn: &mut PgConnection, id: i32) -> AppResult<FileView> {
    let file: File = files::table
        .find(id)
        .select(File::as_select())
        .first(conn)?;
    single_view(conn, file, ViewDepth::Detail)
}

/// Applies `patch` to the file `id`. Only the creator or an admin may edit,
/// and a file can never be moved below itself.
pub fn update(
    conn: &mut PgConnection,
    id: i32,
    patch: FilePatch,
    user: &ActingUser,
) -> AppResult<FileView> {
    let existing: File = files::table
        .find(id)
        .select(File::as_select())
        .first(conn)?;
    if !user.can_manage(existing.created_by) {
        return Err(AppError::forbidden(format!("not allowed to edit file {id}")));
    }
    if patch.is_empty() {
        return single_view(conn, existing, ViewDepth::Detail);
    }

    conn.transaction::<_, AppError, _>(|conn| {
        require_reference(conn, patch.filetype_id, resolve_filetype, "file type")?;
        require_reference(conn, patch.topic_id, resolve_topic, "topic")?;
        require_reference(conn, patch.subject_id, resolve_subject, "subject")?;
        require_reference(conn, patch.parent_id, resolve_parent, "parent file")?;

        if let Some(Some(parent_id)) = patch.parent_id {
            let subtree = walk_subtree(id, |node| {
                Ok(files::table
                    .filter(files::parent_id.eq(node))
                    .select(files::id)
                    .load::<i32>(conn)?)
            })?;
            if subtree.contains(&parent_id) {
                return Err(AppError::bad_request(
                    "a file cannot be moved into itself or one of its descendants",
                ));
            }
        }

        let changeset = FileChangeset {
            name: patch.name.as_deref(),
            filetype_id: patch.filetype_id,
            topic_id: patch.topic_id,
            subject_id: patch.subject_id,
            parent_id: patch.parent_id,
        };
        diesel::update(files::table.find(id))
            .set((&changeset, files::updated_at.eq(Utc::now().naive_utc())))
            .execute(conn)?;
        Ok(())
    })?;

    info!(file_id = id, user_id = user.id, "file updated");
    find_one(conn, id)
}

fn require_reference(
    conn: &mut PgConnection,
    change: Option<Option<i32>>,
    resolve: fn(&mut PgConnection, Option<i32>) -> AppResult<Option<i32>>,
    label: &str,
) -> AppResult<()> {
    if let Some(Some(id)) = change {
        if resolve(conn, Some(id))?.is_none() {
            return Err(AppError::bad_request(format!("{label} {id} does not exist")));
        }
    }
    Ok(())
}

fn single_view(conn: &mut PgConnection, file: File, depth: ViewDepth) -> AppResult<FileView> {
    load_file_views(conn, vec![file], depth)?
        .into_iter()
        .next()
        .ok_or_else(AppError::not_found)
}
