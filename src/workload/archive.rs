use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult, WorkloadError};

fn io_error(context: &'static str, path: &Path, source: std::io::Error) -> AppError {
    AppError::workload(WorkloadError::Io {
        context,
        path: path.to_path_buf(),
        source,
    })
}

/// Extracts every file of `archive` flat into `destination`, replacing
/// whatever was there. Returns the extracted paths.
pub(super) fn extract_flat(archive: &Path, destination: &Path) -> AppResult<Vec<PathBuf>> {
    let zip_error = |source| {
        AppError::workload(WorkloadError::Archive {
            path: archive.to_path_buf(),
            source,
        })
    };
    let file = File::open(archive).map_err(|err| io_error("open archive", archive, err))?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_error)?;

    if destination.exists() {
        std::fs::remove_dir_all(destination)
            .map_err(|err| io_error("clear artifact directory", destination, err))?;
    }
    std::fs::create_dir_all(destination)
        .map_err(|err| io_error("create artifact directory", destination, err))?;

    let mut extracted = Vec::new();
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(zip_error)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry
            .enclosed_name()
            .and_then(|path| path.file_name())
            .map(PathBuf::from)
        else {
            return Err(AppError::workload(WorkloadError::Invalid {
                reference: archive.display().to_string(),
                reason: format!("entry '{}' escapes the archive", entry.name()),
            }));
        };
        let target = destination.join(name);
        let mut out =
            File::create(&target).map_err(|err| io_error("write artifact", &target, err))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|err| io_error("write artifact", &target, err))?;
        extracted.push(target);
    }
    Ok(extracted)
}
