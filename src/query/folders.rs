use super::{Direction, QueryEngine};
use crate::errors::AppResult;
use crate::model::NO_DATE_STRING;
use rusqlite::params;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Newest items shown on a folder card.
pub const PREVIEWS_PER_FOLDER: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderPreview {
    pub hash: u32,
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub color: String,
}

/// One indexed folder, before it is placed in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSummary {
    pub id: u32,
    pub key: String,
    pub count: i64,
    pub previews: Vec<FolderPreview>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderNode {
    /// Absent for intermediate directories that hold no media themselves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<FolderPreview>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FolderNode>,
    #[serde(rename = "imageCount")]
    pub image_count: i64,
}

impl FolderNode {
    fn empty(name: &str, path: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            path: path.to_string(),
            media: Vec::new(),
            children: Vec::new(),
            image_count: 0,
        }
    }
}

impl QueryEngine {
    /// Every folder with its item count and newest previews, as a tree.
    pub fn folders(&self, direction: Direction) -> AppResult<Vec<FolderNode>> {
        let conn = self.db.read_conn()?;

        let mut previews: HashMap<String, Vec<FolderPreview>> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT folder, hash, path, width, height, color FROM (
                SELECT m.folder, m.hash, m.path, m.width, m.height, m.color, m.date,
                       ROW_NUMBER() OVER (PARTITION BY m.folder ORDER BY m.date DESC) AS row_num
                FROM media m
                WHERE m.date != ?1
             )
             WHERE row_num <= ?2
             ORDER BY folder, row_num",
        )?;
        let rows = stmt.query_map(params![NO_DATE_STRING, PREVIEWS_PER_FOLDER], |row| {
            Ok((
                row.get::<_, String>(0)?,
                FolderPreview {
                    hash: row.get(1)?,
                    path: row.get(2)?,
                    width: row.get(3)?,
                    height: row.get(4)?,
                    color: row.get(5)?,
                },
            ))
        })?;
        for row in rows {
            let (folder, preview) = row?;
            previews.entry(folder).or_default().push(preview);
        }

        let mut stmt = conn.prepare(
            "SELECT f.id, f.key, COUNT(m.hash)
             FROM folders f
             LEFT JOIN media m ON m.folder = f.key AND m.date != ?1
             GROUP BY f.id, f.key",
        )?;
        let rows = stmt.query_map(params![NO_DATE_STRING], |row| {
            Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            let (id, key, count) = row?;
            summaries.push(FolderSummary {
                previews: previews.remove(&key).unwrap_or_default(),
                id,
                key,
                count,
            });
        }

        let mut tree = build_tree(summaries);
        if direction == Direction::Desc {
            tree.reverse();
        }
        Ok(tree)
    }
}

/// Splits each key on `/`, creating intermediate nodes as needed. Children
/// are sorted by path at every level; roots come back ascending.
pub fn build_tree(folders: Vec<FolderSummary>) -> Vec<FolderNode> {
    let mut nodes: BTreeMap<String, FolderNode> = BTreeMap::new();

    for folder in folders {
        let mut path = String::new();
        for part in folder.key.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);
            nodes
                .entry(path.clone())
                .or_insert_with(|| FolderNode::empty(part, &path));
        }
        if let Some(node) = nodes.get_mut(&folder.key) {
            node.id = Some(folder.id);
            node.media = folder.previews;
            node.image_count = folder.count;
        }
    }

    // Deepest first, so every node is complete before it moves under its parent.
    let mut paths: Vec<String> = nodes.keys().cloned().collect();
    paths.sort_by_key(|p| Reverse(p.matches('/').count()));

    let mut roots = Vec::new();
    for path in paths {
        let node = match nodes.remove(&path) {
            Some(node) => node,
            None => continue,
        };
        let parent = path.rfind('/').and_then(|idx| nodes.get_mut(&path[..idx]));
        match parent {
            Some(parent) => parent.children.push(node),
            None => roots.push(node),
        }
    }

    sort_nodes(&mut roots);
    roots
}

fn sort_nodes(nodes: &mut [FolderNode]) {
    nodes.sort_by(|a, b| a.path.cmp(&b.path));
    for node in nodes {
        sort_nodes(&mut node.children);
    }
}
