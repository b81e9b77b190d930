//! Processors that persist results to disk.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use log::{error, info};

use crate::event::CassEvent;
use crate::output::{cbf, next_alpha};
use crate::settings::Settings;

use super::result::{ResultData, ResultHandle};
use super::{Input, Operation, ProcessorError, Wiring};

struct WriterState {
    base: PathBuf,
    subdir: Option<String>,
    files_in_subdir: usize,
    written: u64,
}

/// Writes the referenced frame of every accepted event to a byte-offset
/// compressed CBF file `<base>_<eventid>.cbf`; at shutdown a secondary
/// reference is written as `<base>_Dark.cbf`.
///
/// With `MaximumNbrFilesPerDir` set, files rotate through alphabetically
/// counted subdirectories.
pub struct CbfWriter {
    hist_name: String,
    dark_name: String,
    max_files_per_dir: i64,
    state: Mutex<WriterState>,
    hist: OnceLock<Input>,
    dark: OnceLock<Input>,
}

impl CbfWriter {
    /// Parses `HistName`, `DarkName`, `FileBaseName`,
    /// `MaximumNbrFilesPerDir`.
    #[must_use]
    pub fn from_settings(s: &Settings) -> CbfWriter {
        CbfWriter {
            hist_name: s.value_str("HistName", ""),
            dark_name: s.value_str("DarkName", ""),
            max_files_per_dir: s.value_i64("MaximumNbrFilesPerDir", -1),
            state: Mutex::new(WriterState {
                base: PathBuf::from(s.value_str("FileBaseName", "frame")),
                subdir: None,
                files_in_subdir: 0,
                written: 0,
            }),
            hist: OnceLock::new(),
            dark: OnceLock::new(),
        }
    }

    fn write_frame(
        &self,
        handle: &ResultHandle,
        suffix: &str,
        use_subdir: bool,
    ) -> Result<(), ProcessorError> {
        let frame = handle.read().expect("result lock poisoned");
        let (x, y) = frame.axes_2d().ok_or_else(|| ProcessorError::InvalidData {
            name: frame.name().to_string(),
            reason: "referenced result is not an image".to_string(),
        })?;
        let (nx, ny) = (x.nbins, y.nbins);

        let mut state = self.state.lock().expect("state lock poisoned");
        if use_subdir && self.max_files_per_dir != -1 {
            if state.subdir.is_none() || state.files_in_subdir >= self.max_files_per_dir as usize {
                let next = match &state.subdir {
                    Some(current) => next_alpha(current),
                    None => "aa".to_string(),
                };
                state.subdir = Some(next);
                state.files_in_subdir = 0;
            }
        }

        let stem = state
            .base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "frame".to_string());
        let parent = state.base.parent().unwrap_or_else(|| std::path::Path::new(""));
        let mut dir = parent.to_path_buf();
        if use_subdir {
            if let Some(subdir) = &state.subdir {
                dir = dir.join(subdir);
            }
        }
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(&dir).map_err(|source| ProcessorError::Io {
                name: frame.name().to_string(),
                source,
            })?;
        }
        let filename = dir.join(format!("{stem}_{suffix}.cbf"));

        cbf::write(&filename, frame.bins(), nx, ny).map_err(|source| ProcessorError::Io {
            name: frame.name().to_string(),
            source,
        })?;
        state.files_in_subdir += 1;
        state.written += 1;
        Ok(())
    }
}

impl Operation for CbfWriter {
    fn dependencies(&self) -> Vec<String> {
        vec![self.hist_name.clone(), self.dark_name.clone()]
    }

    fn wire(&mut self, wiring: &Wiring) -> Result<ResultData, ProcessorError> {
        let hist = wiring.input(&self.hist_name)?;
        let dark = wiring.input(&self.dark_name)?;
        for input in [&hist, &dark] {
            if input.template().axes_2d().is_none() {
                return Err(ProcessorError::ShapeMismatch {
                    name: wiring.node_name().to_string(),
                    reason: format!("input '{}' is not two dimensional", input.name()),
                });
            }
        }
        let _ = self.hist.set(hist);
        let _ = self.dark.set(dark);
        // the scalar counts the written files; the node is forced hidden
        Ok(ResultData::new_scalar(""))
    }

    fn process(&self, event: &CassEvent, result: &mut ResultData) -> Result<(), ProcessorError> {
        let frame = self
            .hist
            .get()
            .expect("input wired before processing")
            .result(event.id())?;
        self.write_frame(&frame, &event.id().to_string(), true)?;
        let written = self.state.lock().expect("state lock poisoned").written;
        result.set_scalar(written as f64);
        Ok(())
    }

    fn accumulating(&self) -> bool {
        true
    }

    fn about_to_quit(&self, _latest: &ResultHandle) {
        let dark = match self.dark.get() {
            Some(input) => input,
            None => return,
        };
        let handle = match dark.result(0) {
            Ok(handle) => handle,
            Err(err) => {
                error!("cannot fetch the dark frame: {err}");
                return;
            }
        };
        if let Err(err) = self.write_frame(&handle, "Dark", false) {
            error!("cannot write the dark frame: {err}");
        } else {
            info!("dark frame written");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{GraphContext, ProcessorGraph};
    use crate::settings::Settings as S;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn writes_one_file_per_event_and_a_dark_at_quit() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("run7");
        let settings = S::from_str(&format!(
            r#"
[PostProcessor.img]
Kind = "constant"
Value = 42.0
Dimension = 2
XNbrBins = 4
XUp = 4.0
YNbrBins = 4
YUp = 4.0
[PostProcessor.dump]
Kind = "cbf_writer"
HistName = "img"
DarkName = "img"
FileBaseName = "{}"
"#,
            base.display()
        ))
        .unwrap();
        let graph = ProcessorGraph::load(&settings, &GraphContext::new(), 1).unwrap();
        let shutdown = AtomicBool::new(false);
        for id in [100u64, 101] {
            let mut event = crate::event::CassEvent::allocate(16);
            event.set_id(id);
            graph.process_event(&event, &shutdown);
            graph.release_event(id);
        }
        graph.about_to_quit();

        assert!(dir.path().join("run7_100.cbf").exists());
        assert!(dir.path().join("run7_101.cbf").exists());
        assert!(dir.path().join("run7_Dark.cbf").exists());
    }
}
