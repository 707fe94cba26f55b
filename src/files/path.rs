use crate::error::{Error, Result};

/// Normalise an operator-supplied path to an absolute, slash-separated form.
///
/// Any `..` segment is refused outright rather than resolved.
pub fn normalize(raw: &str) -> Result<String> {
    if raw.contains('\0') {
        return Err(Error::PathTraversal(raw.replace('\0', "\\0")));
    }
    let unified = raw.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(Error::PathTraversal(raw.to_string())),
            other => segments.push(other),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Split a normalised path into parent directory and final component.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

pub fn join(dir: &str, rel: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), rel.trim_start_matches('/'))
}
