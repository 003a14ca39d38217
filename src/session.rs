//! Interface to the externally managed login session.
//!
//! A separate collaborator (a headless-browser login routine) keeps a browser
//! profile directory authenticated against the target site. This module never
//! looks inside that artifact: it only decides whether it is usable and
//! translates it into the cookie flags the extraction tool understands. A
//! plain Netscape cookies file is supported as the lighter-weight variant of
//! the same contract.

use std::fs;
use std::path::{Path, PathBuf};

/// Read-only view of the session artifacts the login collaborator maintains.
#[derive(Debug, Clone, Default)]
pub struct SessionProfile {
    profile_dir: Option<PathBuf>,
    cookies_file: Option<PathBuf>,
}

impl SessionProfile {
    pub fn new(profile_dir: Option<PathBuf>, cookies_file: Option<PathBuf>) -> Self {
        Self {
            profile_dir,
            cookies_file,
        }
    }

    /// A profile directory is usable when it exists and the browser has
    /// written anything into it. An empty directory means the collaborator
    /// has not run yet.
    fn profile_usable(&self) -> bool {
        match &self.profile_dir {
            Some(dir) => dir_is_populated(dir),
            None => false,
        }
    }

    fn cookies_usable(&self) -> bool {
        self.cookies_file.as_deref().is_some_and(Path::is_file)
    }

    /// Whether any session artifact can be handed to the tool.
    pub fn is_usable(&self) -> bool {
        self.profile_usable() || self.cookies_usable()
    }

    /// Appends the cookie flags for whichever artifact is usable. The
    /// cookies file wins over the profile directory when both exist, since
    /// it is cheaper for the tool to consume.
    pub fn apply(&self, args: &mut Vec<String>) {
        if self.cookies_usable() {
            if let Some(file) = &self.cookies_file {
                args.push("--cookies".into());
                args.push(file.to_string_lossy().into_owned());
            }
            return;
        }
        if self.profile_usable()
            && let Some(dir) = &self.profile_dir
        {
            args.push("--cookies-from-browser".into());
            args.push(format!("chromium:{}", dir.to_string_lossy()));
        }
    }
}

fn dir_is_populated(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}
