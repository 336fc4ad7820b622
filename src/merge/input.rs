//! Discovering merge input files

use crate::config::Config;
use crate::file::FILE_EXTENSION;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{trace, warn};

fn is_cache_file(path: &Path) -> bool {
    path.extension().map(|e| e == FILE_EXTENSION).unwrap_or(false)
}

fn walk_dir(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(target: crate::logging::MERGE, dir = %dir.display(), error = %e, "cannot open directory");
            return;
        }
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
    paths.sort();
    for path in paths {
        add_file_or_directory(&path, files);
    }
}

fn add_file_or_directory(path: &Path, files: &mut Vec<PathBuf>) {
    if path.is_dir() {
        walk_dir(path, files);
    } else if !path.exists() {
        warn!(target: crate::logging::MERGE, path = %path.display(), "input does not exist");
    } else if is_cache_file(path) {
        trace!(target: crate::logging::MERGE, path = %path.display(), "merge input");
        files.push(path.to_path_buf());
    }
}

/// Cache files named by `input_files` (a file or a directory searched
/// recursively) and by the lines of `input_list_file`
pub fn collect_input_files(config: &Config) -> Result<Vec<PathBuf>> {
    if config.input_files.is_none() && config.input_list_file.is_none() {
        return Err(Error::config("merge needs input_files= or input_list_file="));
    }
    let mut files = Vec::new();
    if let Some(path) = &config.input_files {
        add_file_or_directory(path, &mut files);
    }
    if let Some(list) = &config.input_list_file {
        let text = std::fs::read_to_string(list)?;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            add_file_or_directory(Path::new(line), &mut files);
        }
    }
    if files.is_empty() {
        return Err(Error::config("no input cache files found"));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_walks_directories_and_list_file() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        for name in ["a.csa", "b.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::write(nested.join("c.csa"), b"x").unwrap();

        let config = Config::default().with_input_files(dir.path());
        let files = collect_input_files(&config).unwrap();
        assert_eq!(files, vec![dir.path().join("a.csa"), nested.join("c.csa")]);

        let list = dir.path().join("inputs.lst");
        std::fs::write(
            &list,
            format!("{}\n\n{}\n", nested.join("c.csa").display(), dir.path().join("gone.csa").display()),
        )
        .unwrap();
        let config = Config {
            input_list_file: Some(list),
            ..Config::default()
        };
        assert_eq!(collect_input_files(&config).unwrap(), vec![nested.join("c.csa")]);
    }

    #[test]
    fn test_requires_some_input() {
        assert!(matches!(collect_input_files(&Config::default()), Err(Error::Config(_))));
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().with_input_files(dir.path());
        assert!(matches!(collect_input_files(&config), Err(Error::Config(_))));
    }
}
