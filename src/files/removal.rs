use std::collections::{HashMap, HashSet};

use diesel::{prelude::*, PgConnection};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::File;
use crate::policy::ActingUser;
use crate::schema::{files, images, voices};
use crate::storage::PublicStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoveOutcome {
    pub affected: usize,
}

/// On-disk leftovers of a deleted subtree, as keys under the public root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts {
    pub primary_paths: Vec<String>,
    pub image_paths: Vec<String>,
    pub voice_paths: Vec<String>,
}

/// Ids of `root` and every node reachable through `children_of`, parents
/// before children. Each id is visited once, so cycles terminate.
pub fn walk_subtree<F>(root: i32, mut children_of: F) -> AppResult<Vec<i32>>
where
    F: FnMut(i32) -> AppResult<Vec<i32>>,
{
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![root];

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id);
        for child in children_of(id)? {
            if !visited.contains(&child) {
                stack.push(child);
            }
        }
    }

    Ok(order)
}

/// Every node must be manageable by `user`; nothing is deleted otherwise.
pub fn authorize_subtree(user: &ActingUser, nodes: &[File]) -> AppResult<()> {
    match nodes.iter().find(|file| !user.can_manage(file.created_by)) {
        Some(file) => Err(AppError::forbidden(format!(
            "not allowed to delete file {}",
            file.id
        ))),
        None => Ok(()),
    }
}

/// Deletes the file `id`, its descendants and their images and voices. Rows
/// go in one transaction; the returned artifacts still have to be removed
/// from disk.
pub fn remove_rows(
    conn: &mut PgConnection,
    id: i32,
    user: &ActingUser,
) -> AppResult<(RemoveOutcome, Artifacts)> {
    conn.transaction::<_, AppError, _>(|conn| {
        let ids = walk_subtree(id, |parent_id| {
            Ok(files::table
                .filter(files::parent_id.eq(parent_id))
                .select(files::id)
                .load::<i32>(conn)?)
        })?;

        let nodes: Vec<File> = files::table
            .filter(files::id.eq_any(&ids))
            .select(File::as_select())
            .load(conn)?;
        if !nodes.iter().any(|file| file.id == id) {
            return Err(AppError::not_found());
        }

        authorize_subtree(user, &nodes)?;

        let image_paths: Vec<String> = images::table
            .filter(images::file_id.eq_any(&ids))
            .order(images::id.asc())
            .select(images::path)
            .load(conn)?;
        diesel::delete(images::table.filter(images::file_id.eq_any(&ids))).execute(conn)?;

        let voice_paths: Vec<String> = voices::table
            .filter(voices::file_id.eq_any(&ids))
            .order(voices::id.asc())
            .select(voices::path)
            .load(conn)?;
        diesel::delete(voices::table.filter(voices::file_id.eq_any(&ids))).execute(conn)?;

        let mut affected = 0;
        for file_id in ids.iter().rev() {
            affected += diesel::delete(files::table.find(*file_id)).execute(conn)?;
        }

        let by_id: HashMap<i32, &File> = nodes.iter().map(|file| (file.id, file)).collect();
        let primary_paths = ids
            .iter()
            .filter_map(|file_id| by_id.get(file_id))
            .filter_map(|file| file.path.clone())
            .collect();

        Ok((
            RemoveOutcome { affected },
            Artifacts {
                primary_paths,
                image_paths,
                voice_paths,
            },
        ))
    })
}

/// Removes whatever of `artifacts` is still on disk. Missing files and
/// failures are logged; they never fail the removal.
pub async fn cleanup_artifacts(storage: &dyn PublicStorage, artifacts: &Artifacts) -> usize {
    let mut removed = 0;
    for key in artifacts
        .primary_paths
        .iter()
        .chain(artifacts.image_paths.iter())
        .chain(artifacts.voice_paths.iter())
    {
        match storage.delete_object(key).await {
            Ok(true) => removed += 1,
            Ok(false) => warn!(path = %key, "artifact already missing on disk"),
            Err(err) => warn!(path = %key, error = %err, "failed to remove artifact"),
        }
    }
    removed
}

pub async fn remove(
    conn: &mut PgConnection,
    storage: &dyn PublicStorage,
    id: i32,
    user: &ActingUser,
) -> AppResult<RemoveOutcome> {
    let (outcome, artifacts) = remove_rows(conn, id, user)?;
    let removed = cleanup_artifacts(storage, &artifacts).await;
    info!(
        file_id = id,
        affected = outcome.affected,
        removed_from_disk = removed,
        "removed file subtree"
    );
    Ok(outcome)
}
