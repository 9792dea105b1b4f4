use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::Serialize;

use crate::error::AppResult;
use crate::models::{File, FileType, Grade, Image, School, Subject, Topic, User, Voice, VoiceType};
use crate::schema::{
    file_types, files, grades, images, schools, subjects, topics, user_subjects, users,
    voice_types, voices,
};

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    pub id: i32,
    pub name: String,
    pub path: Option<String>,
    pub parent_id: Option<i32>,
    pub created_by: Option<i32>,
    pub school_id: Option<i32>,
    pub filetype_id: Option<i32>,
    pub topic_id: Option<i32>,
    pub subject_id: Option<i32>,
    pub created_at: String,
    pub updated_at: String,
    pub file_type: Option<NamedView>,
    pub subject: Option<SubjectView>,
    pub topic: Option<NamedView>,
    pub images: Vec<ImageView>,
    pub school: Option<SchoolView>,
    pub voices: Vec<VoiceView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ChildView>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedView {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectView {
    pub id: i32,
    pub name: String,
    pub grade: Option<NamedView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageView {
    pub id: i32,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolView {
    pub id: i32,
    pub name: String,
    pub school_type: String,
    pub is_admin: bool,
    pub users: Vec<SchoolUserView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchoolUserView {
    pub id: i32,
    pub username: String,
    pub role: String,
    pub subjects: Vec<NamedView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceView {
    pub id: i32,
    pub name: String,
    pub path: String,
    pub type_voice: Option<NamedView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildView {
    pub id: i32,
    pub name: String,
    pub path: Option<String>,
    pub created_at: String,
}

/// How much of the relation graph to attach to each file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDepth {
    /// Everything the listing shows.
    Listing,
    /// The listing relations plus the direct children.
    Detail,
}

/// Attaches relations to `rows` with one query per relation, keeping the
/// input order.
pub fn load_file_views(
    conn: &mut PgConnection,
    rows: Vec<File>,
    depth: ViewDepth,
) -> AppResult<Vec<FileView>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let file_ids: Vec<i32> = rows.iter().map(|file| file.id).collect();

    let file_types = load_file_types(conn, &collect_ids(&rows, |file| file.filetype_id))?;
    let topics = load_topics(conn, &collect_ids(&rows, |file| file.topic_id))?;
    let subjects = load_subjects(conn, &collect_ids(&rows, |file| file.subject_id))?;
    let schools = load_schools(conn, &collect_ids(&rows, |file| file.school_id))?;
    let mut images = load_images(conn, &file_ids)?;
    let mut voices = load_voices(conn, &file_ids)?;
    let mut children = match depth {
        ViewDepth::Detail => Some(load_children(conn, &file_ids)?),
        ViewDepth::Listing => None,
    };

    let views = rows
        .into_iter()
        .map(|file| FileView {
            file_type: file.filetype_id.and_then(|id| file_types.get(&id).cloned()),
            subject: file.subject_id.and_then(|id| subjects.get(&id).cloned()),
            topic: file.topic_id.and_then(|id| topics.get(&id).cloned()),
            school: file.school_id.and_then(|id| schools.get(&id).cloned()),
            images: images.remove(&file.id).unwrap_or_default(),
            voices: voices.remove(&file.id).unwrap_or_default(),
            children: children
                .as_mut()
                .map(|map| map.remove(&file.id).unwrap_or_default()),
            id: file.id,
            name: file.name,
            path: file.path,
            parent_id: file.parent_id,
            created_by: file.created_by,
            school_id: file.school_id,
            filetype_id: file.filetype_id,
            topic_id: file.topic_id,
            subject_id: file.subject_id,
            created_at: to_iso(file.created_at),
            updated_at: to_iso(file.updated_at),
        })
        .collect();

    Ok(views)
}

fn collect_ids(rows: &[File], key: impl Fn(&File) -> Option<i32>) -> Vec<i32> {
    let unique: HashSet<i32> = rows.iter().filter_map(key).collect();
    unique.into_iter().collect()
}

fn load_file_types(conn: &mut PgConnection, ids: &[i32]) -> AppResult<HashMap<i32, NamedView>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<FileType> = file_types::table
        .filter(file_types::id.eq_any(ids))
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|row| (row.id, NamedView { id: row.id, name: row.name }))
        .collect())
}

fn load_topics(conn: &mut PgConnection, ids: &[i32]) -> AppResult<HashMap<i32, NamedView>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<Topic> = topics::table.filter(topics::id.eq_any(ids)).load(conn)?;
    Ok(rows
        .into_iter()
        .map(|row| (row.id, NamedView { id: row.id, name: row.name }))
        .collect())
}

fn load_subjects(conn: &mut PgConnection, ids: &[i32]) -> AppResult<HashMap<i32, SubjectView>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(Subject, Option<Grade>)> = subjects::table
        .left_join(grades::table)
        .filter(subjects::id.eq_any(ids))
        .select((Subject::as_select(), Option::<Grade>::as_select()))
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|(subject, grade)| {
            (
                subject.id,
                SubjectView {
                    id: subject.id,
                    name: subject.name,
                    grade: grade.map(|grade| NamedView {
                        id: grade.id,
                        name: grade.name,
                    }),
                },
            )
        })
        .collect())
}

fn load_images(conn: &mut PgConnection, file_ids: &[i32]) -> AppResult<HashMap<i32, Vec<ImageView>>> {
    let rows: Vec<Image> = images::table
        .filter(images::file_id.eq_any(file_ids))
        .order(images::id.asc())
        .load(conn)?;

    let mut map: HashMap<i32, Vec<ImageView>> = HashMap::new();
    for image in rows {
        map.entry(image.file_id).or_default().push(ImageView {
            id: image.id,
            name: image.name,
            path: image.path,
        });
    }
    Ok(map)
}

fn load_voices(conn: &mut PgConnection, file_ids: &[i32]) -> AppResult<HashMap<i32, Vec<VoiceView>>> {
    let rows: Vec<(Voice, Option<VoiceType>)> = voices::table
        .left_join(voice_types::table)
        .filter(voices::file_id.eq_any(file_ids))
        .order(voices::id.asc())
        .select((Voice::as_select(), Option::<VoiceType>::as_select()))
        .load(conn)?;

    let mut map: HashMap<i32, Vec<VoiceView>> = HashMap::new();
    for (voice, voice_type) in rows {
        map.entry(voice.file_id).or_default().push(VoiceView {
            id: voice.id,
            name: voice.name,
            path: voice.path,
            type_voice: voice_type.map(|kind| NamedView {
                id: kind.id,
                name: kind.name,
            }),
        });
    }
    Ok(map)
}

/// Schools with the users attached to them and each user's subjects.
fn load_schools(conn: &mut PgConnection, ids: &[i32]) -> AppResult<HashMap<i32, SchoolView>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let school_rows: Vec<School> = schools::table.filter(schools::id.eq_any(ids)).load(conn)?;
    let member_rows: Vec<User> = users::table
        .filter(users::school_id.eq_any(ids))
        .order(users::id.asc())
        .load(conn)?;

    let member_ids: Vec<i32> = member_rows.iter().map(|user| user.id).collect();
    let subject_rows: Vec<(i32, Subject)> = if member_ids.is_empty() {
        Vec::new()
    } else {
        user_subjects::table
            .inner_join(subjects::table)
            .filter(user_subjects::user_id.eq_any(&member_ids))
            .order(subjects::id.asc())
            .select((user_subjects::user_id, Subject::as_select()))
            .load(conn)?
    };

    let mut subjects_by_user: HashMap<i32, Vec<NamedView>> = HashMap::new();
    for (user_id, subject) in subject_rows {
        subjects_by_user.entry(user_id).or_default().push(NamedView {
            id: subject.id,
            name: subject.name,
        });
    }

    let mut members_by_school: HashMap<i32, Vec<SchoolUserView>> = HashMap::new();
    for user in member_rows {
        let Some(school_id) = user.school_id else {
            continue;
        };
        members_by_school
            .entry(school_id)
            .or_default()
            .push(SchoolUserView {
                subjects: subjects_by_user.remove(&user.id).unwrap_or_default(),
                id: user.id,
                username: user.username,
                role: user.role,
            });
    }

    Ok(school_rows
        .into_iter()
        .map(|school| {
            (
                school.id,
                SchoolView {
                    users: members_by_school.remove(&school.id).unwrap_or_default(),
                    id: school.id,
                    name: school.name,
                    school_type: school.school_type,
                    is_admin: school.is_admin,
                },
            )
        })
        .collect())
}

fn load_children(conn: &mut PgConnection, file_ids: &[i32]) -> AppResult<HashMap<i32, Vec<ChildView>>> {
    let rows: Vec<File> = files::table
        .filter(files::parent_id.eq_any(file_ids))
        .order((files::created_at.asc(), files::id.asc()))
        .load(conn)?;

    let mut map: HashMap<i32, Vec<ChildView>> = HashMap::new();
    for child in rows {
        let Some(parent_id) = child.parent_id else {
            continue;
        };
        map.entry(parent_id).or_default().push(ChildView {
            id: child.id,
            name: child.name,
            path: child.path,
            created_at: to_iso(child.created_at),
        });
    }
    Ok(map)
}
