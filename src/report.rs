//! What a finished session tells the user.

use crate::mode::Viewer;
use crate::session::Session;
use std::path::{Path, PathBuf};

const PPROF_DOCS: &str =
    "https://github.com/google/pprof/blob/main/doc/README.md#graphical-reports";
const PERFETTO_UI: &str = "https://ui.perfetto.dev";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub path: PathBuf,
    pub viewer: Viewer,
    pub interrupted: bool,
}

impl Report {
    pub fn new(session: &Session) -> Self {
        Report {
            path: absolute(session.output_path()),
            viewer: session.mode().viewer(),
            interrupted: session.interrupted(),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let path = self.path.display();
        let ext = self
            .path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut lines = vec![format!(
            "profiling completed.  You can find the .{ext} file at {path}"
        )];
        match self.viewer {
            Viewer::Pprof => {
                lines.push(format!("to view the profile, run `pprof -http=:8080 {path}`"));
                lines.push("port can be any ephemeral port you wish to use.".to_string());
                lines.push(format!("Graph interpretation is outlined here: {PPROF_DOCS}"));
            }
            Viewer::Perfetto => {
                lines.push(format!("to view the trace, load {path} into {PERFETTO_UI}"));
            }
        }
        if self.interrupted {
            lines.push("[warning] profiling was interrupted, data may be incomplete".to_string());
        }
        lines
    }

    pub fn print(&self) {
        for line in self.lines() {
            eprintln!("{line}");
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
