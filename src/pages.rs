//! Page discovery for framework services.
//!
//! Pages live under `pages/` or `src/pages/` in the service root. Each file
//! becomes a route key: `pages/stuff/index.js` is `/stuff`, `pages/stuff/[id].tsx`
//! is `/stuff/[id]`. Keys are sorted from most to least specific and turned into
//! anchored regular expressions.

use crate::error::RouteError;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

pub const PAGE_EXTENSIONS: [&str; 4] = ["js", "jsx", "ts", "tsx"];
pub const PAGE_DIRS: [&str; 2] = ["pages", "src/pages"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Static(&'a str),
    Dynamic(&'a str),
    CatchAll(&'a str),
    OptionalCatchAll(&'a str),
}

impl<'a> Segment<'a> {
    fn parse(page: &str, raw: &'a str) -> Result<Self, RouteError> {
        let segment = if let Some(name) = raw
            .strip_prefix("[[...")
            .and_then(|s| s.strip_suffix("]]"))
        {
            Segment::OptionalCatchAll(name)
        } else if let Some(name) = raw.strip_prefix("[...").and_then(|s| s.strip_suffix(']')) {
            Segment::CatchAll(name)
        } else if let Some(name) = raw.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            Segment::Dynamic(name)
        } else {
            return Ok(Segment::Static(raw));
        };

        let name = segment.param_name().unwrap_or_default();
        if name.is_empty() {
            return Err(invalid(page, format!("empty parameter name in \"{raw}\"")));
        }
        if name.starts_with('[') || name.ends_with(']') {
            return Err(invalid(
                page,
                format!("segment names may not start or end with extra brackets (\"{name}\")"),
            ));
        }
        if name.starts_with('.') {
            return Err(invalid(
                page,
                format!("segment names may not start with \".\" (\"{name}\")"),
            ));
        }
        Ok(segment)
    }

    fn param_name(&self) -> Option<&'a str> {
        match *self {
            Segment::Static(_) => None,
            Segment::Dynamic(name) | Segment::CatchAll(name) | Segment::OptionalCatchAll(name) => {
                Some(name)
            }
        }
    }

    /// Sort key: statics first in lexical order, then dynamic, catch-all, optional catch-all
    fn rank(&self) -> (u8, &'a str) {
        match *self {
            Segment::Static(s) => (0, s),
            Segment::Dynamic(_) => (1, ""),
            Segment::CatchAll(_) => (2, ""),
            Segment::OptionalCatchAll(_) => (3, ""),
        }
    }

    /// Shape of the segment without its parameter name
    fn shape(&self) -> &'a str {
        match *self {
            Segment::Static(s) => s,
            Segment::Dynamic(_) => "[]",
            Segment::CatchAll(_) => "[...]",
            Segment::OptionalCatchAll(_) => "[[...]]",
        }
    }

    fn regex(&self) -> String {
        match *self {
            Segment::Static(s) => format!("/{}", regex::escape(s)),
            Segment::Dynamic(_) => "/([^/]+?)".to_string(),
            Segment::CatchAll(_) => "/(.+?)".to_string(),
            Segment::OptionalCatchAll(_) => "(?:/(.+?))?".to_string(),
        }
    }
}

fn invalid(page: &str, reason: String) -> RouteError {
    RouteError::InvalidPage {
        page: page.to_string(),
        reason,
    }
}

fn segments(page: &str) -> Result<Vec<Segment<'_>>, RouteError> {
    page.split('/')
        .filter(|s| !s.is_empty())
        .map(|raw| Segment::parse(page, raw))
        .collect()
}

/// Find all page keys of the service rooted at `root_dir`.
///
/// Two files of the same service that map to one key (`stuff.js` and
/// `stuff/index.js`, or a page in both `pages/` and `src/pages/`) are a
/// duplicate route.
pub async fn discover(root_dir: &Path) -> Result<Vec<String>, RouteError> {
    let mut files: HashMap<String, PathBuf> = HashMap::new();

    for pages_dir in PAGE_DIRS {
        let mut pending = vec![root_dir.join(pages_dir)];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(RouteError::PageScan { dir, source }),
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(source) => return Err(RouteError::PageScan { dir, source }),
                };
                let path = entry.path();
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }

                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|source| RouteError::PageScan {
                        dir: dir.clone(),
                        source,
                    })?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(root_dir) {
                    if let Some(key) = page_key(relative) {
                        if let Some(first) = files.get(&key) {
                            return Err(RouteError::DuplicateRoute {
                                route: key,
                                first: first.clone(),
                                second: path,
                            });
                        }
                        files.insert(key, path);
                    }
                }
            }
        }
    }

    let mut keys: Vec<String> = files.into_keys().collect();
    keys.sort();
    Ok(keys)
}

/// Route key for a page file, given its path relative to the service root.
///
/// Returns `None` for files outside the pages directories, unsupported
/// extensions and internal pages whose file name starts with `_`.
pub fn page_key(relative: &Path) -> Option<String> {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    let rest = match parts.as_slice() {
        [src, pages, rest @ ..] if src == "src" && pages == "pages" => rest,
        [pages, rest @ ..] if pages == "pages" => rest,
        _ => return None,
    };
    let (file, dirs) = rest.split_last()?;

    let file = Path::new(file);
    let extension = file.extension()?.to_str()?;
    if !PAGE_EXTENSIONS.contains(&extension) {
        return None;
    }
    let stem = file.file_stem()?.to_str()?;
    if stem.starts_with('_') {
        return None;
    }

    let mut key = String::new();
    for dir in dirs {
        key.push('/');
        key.push_str(dir);
    }
    if stem != "index" {
        key.push('/');
        key.push_str(stem);
    }
    if key.is_empty() {
        key.push('/');
    }
    Some(key)
}

/// Check a set of page keys for conflicts the router cannot resolve
pub fn validate(pages: &[String]) -> Result<(), RouteError> {
    let mut slug_names: HashMap<String, (&str, &str)> = HashMap::new();
    let mut rest_slugs: HashMap<String, (&str, bool, &str)> = HashMap::new();
    let mut shapes: HashSet<String> = HashSet::new();
    let mut parsed = Vec::with_capacity(pages.len());

    for page in pages {
        let segs = segments(page)?;
        let mut seen = HashSet::new();
        let mut prefix = String::new();

        for (i, seg) in segs.iter().enumerate() {
            if let Some(name) = seg.param_name() {
                if !seen.insert(name) {
                    return Err(invalid(
                        page,
                        format!("the slug name \"{name}\" repeats within a single dynamic path"),
                    ));
                }
            }

            match *seg {
                Segment::Dynamic(name) => {
                    let (previous, previous_page) =
                        *slug_names.entry(prefix.clone()).or_insert((name, page.as_str()));
                    if previous != name {
                        return Err(invalid(
                            page,
                            format!(
                                "different slug names for the same dynamic path (\"{previous}\" in {previous_page} and \"{name}\")"
                            ),
                        ));
                    }
                }
                Segment::CatchAll(name) | Segment::OptionalCatchAll(name) => {
                    if i + 1 != segs.len() {
                        return Err(invalid(
                            page,
                            "catch-all must be the last part of the URL".to_string(),
                        ));
                    }
                    let optional = matches!(seg, Segment::OptionalCatchAll(_));
                    let (previous, previous_optional, previous_page) = *rest_slugs
                        .entry(prefix.clone())
                        .or_insert((name, optional, page.as_str()));
                    if previous_optional != optional {
                        return Err(invalid(
                            page,
                            format!(
                                "a required and an optional catch-all route at the same level ({previous_page})"
                            ),
                        ));
                    }
                    if previous != name {
                        return Err(invalid(
                            page,
                            format!(
                                "different slug names for the same catch-all path (\"{previous}\" in {previous_page} and \"{name}\")"
                            ),
                        ));
                    }
                }
                Segment::Static(_) => {}
            }

            prefix.push('/');
            prefix.push_str(seg.shape());
        }

        if prefix.is_empty() {
            prefix.push('/');
        }
        shapes.insert(prefix);
        parsed.push((page, segs));
    }

    for (page, segs) in &parsed {
        if let Some((Segment::OptionalCatchAll(_), parents)) = segs.split_last() {
            let mut parent: String = parents.iter().map(|s| format!("/{}", s.shape())).collect();
            if parent.is_empty() {
                parent.push('/');
            }
            if shapes.contains(&parent) {
                return Err(invalid(
                    page,
                    format!("a route with the same specificity as an optional catch-all route exists (\"{parent}\")"),
                ));
            }
        }
    }

    Ok(())
}

/// Validate and order page keys from most to least specific
pub fn sort(pages: &[String]) -> Result<Vec<String>, RouteError> {
    validate(pages)?;

    let mut keyed = pages
        .iter()
        .map(|page| {
            let rank: Vec<(u8, &str)> = segments(page)?.iter().map(Segment::rank).collect();
            Ok((rank, page))
        })
        .collect::<Result<Vec<_>, RouteError>>()?;
    keyed.sort();
    keyed.dedup_by(|a, b| a.1 == b.1);

    Ok(keyed.into_iter().map(|(_, page)| page.clone()).collect())
}

/// Anchored regular expression source for a page key
pub fn page_regex(page: &str) -> Result<String, RouteError> {
    let segs = segments(page)?;
    if segs.is_empty() {
        return Ok("^/(?:/)?$".to_string());
    }

    let mut source = String::from("^");
    for seg in &segs {
        source.push_str(&seg.regex());
    }
    source.push_str("(?:/)?$");
    Ok(source)
}

/// Directories to watch for page changes
pub fn page_dirs(root_dir: &Path) -> Vec<PathBuf> {
    PAGE_DIRS
        .iter()
        .map(|dir| root_dir.join(dir))
        .filter(|dir| dir.is_dir())
        .collect()
}
