use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::Path;

use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{FramevecError, FramevecResult};
use crate::job::JobId;
use crate::output::{list_frame_files, natural_cmp};
use crate::workspace::Workspace;

pub const NO_VALID_FRAMES_MESSAGE: &str = "No valid SVG files found in the ZIP";

/// Unpack `archive` into `dest`, keeping its internal layout. Entries that
/// would land outside `dest` are skipped. Returns the number of files written.
pub fn extract_archive_into(archive: &Path, dest: &Path) -> FramevecResult<usize> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;
    let mut written = 0;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "Skipping archive entry outside the job directory");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }

    Ok(written)
}

/// Turn an uploaded zip of vector frames into a new job.
///
/// The job directory is kept even when validation fails, matching the
/// conversion path where a directory exists as soon as a job is accepted.
pub fn import_archive(workspace: &Workspace, archive: &Path) -> FramevecResult<(JobId, Vec<String>)> {
    let (id, dir) = workspace.new_job()?;
    let written = extract_archive_into(archive, &dir)?;
    let frames = list_frame_files(&dir)?;

    if frames.is_empty() {
        warn!(job_id = %id, written, "Archive contained no frames");
        return Err(FramevecError::validation(NO_VALID_FRAMES_MESSAGE));
    }

    info!(job_id = %id, frames = frames.len(), written, "Imported frame archive");
    Ok((id, frames))
}

/// Write a flat zip of every regular file directly inside `job_dir` to `out`,
/// one entry at a time, and hand `out` back once the archive is finalized.
pub fn write_job_archive<W: Write + Seek>(job_dir: &Path, out: W) -> FramevecResult<W> {
    let mut names = Vec::new();
    for entry in fs::read_dir(job_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => warn!(?name, "Skipping non UTF-8 file name in archive"),
        }
    }
    names.sort_by(|a, b| natural_cmp(a, b));

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9));
    let mut zip = ZipWriter::new(out);
    for name in &names {
        let mut source = File::open(job_dir.join(name))?;
        zip.start_file(name.as_str(), options)?;
        io::copy(&mut source, &mut zip)?;
    }
    Ok(zip.finish()?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::{Cursor, Read};
    use tempfile::tempdir;

    pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = ZipWriter::new(file);
        for (name, bytes) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }

    pub(crate) fn read_zip(bytes: Vec<u8>) -> BTreeMap<String, Vec<u8>> {
        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut out = BTreeMap::new();
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).unwrap();
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).unwrap();
            out.insert(entry.name().to_string(), buf);
        }
        out
    }

    fn workspace(root: &Path) -> Workspace {
        let workspace = Workspace::new(root.join("frames"), root.join("out"));
        workspace.initialize().unwrap();
        workspace
    }

    #[test]
    fn import_with_one_frame_lists_that_frame() {
        let temp = tempdir().unwrap();
        let workspace = workspace(temp.path());
        let archive = temp.path().join("upload.zip");
        write_zip(&archive, &[("frame_0000.svg", b"<svg/>")]);

        let (id, frames) = import_archive(&workspace, &archive).unwrap();

        assert_eq!(frames, ["frame_0000.svg"]);
        assert!(workspace.job_dir(id).join("frame_0000.svg").is_file());
    }

    #[test]
    fn import_without_frames_is_a_validation_error() {
        let temp = tempdir().unwrap();
        let workspace = workspace(temp.path());
        let archive = temp.path().join("upload.zip");
        write_zip(&archive, &[("readme.txt", b"hello"), ("image.png", b"png")]);

        let err = import_archive(&workspace, &archive).unwrap_err();
        match err {
            FramevecError::Validation(msg) => assert_eq!(msg, NO_VALID_FRAMES_MESSAGE),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn import_of_corrupt_archive_is_an_archive_error() {
        let temp = tempdir().unwrap();
        let workspace = workspace(temp.path());
        let archive = temp.path().join("upload.zip");
        fs::write(&archive, vec![b'x'; 256]).unwrap();

        let err = import_archive(&workspace, &archive).unwrap_err();
        assert!(matches!(err, FramevecError::Archive(_)));
    }

    #[test]
    fn extraction_skips_entries_escaping_the_destination() {
        let temp = tempdir().unwrap();
        let dest = temp.path().join("dest");
        fs::create_dir_all(&dest).unwrap();
        let archive = temp.path().join("evil.zip");
        write_zip(
            &archive,
            &[("../escaped.svg", b"<svg/>"), ("ok.svg", b"<svg/>")],
        );

        let written = extract_archive_into(&archive, &dest).unwrap();

        assert_eq!(written, 1);
        assert!(dest.join("ok.svg").is_file());
        assert!(!temp.path().join("escaped.svg").exists());
    }

    #[test]
    fn job_archive_is_flat_and_byte_identical() {
        let temp = tempdir().unwrap();
        let job_dir = temp.path().join("job");
        fs::create_dir_all(job_dir.join("nested")).unwrap();
        fs::write(job_dir.join("frame_0000.svg"), b"<svg>0</svg>").unwrap();
        fs::write(job_dir.join("frame_0003.svg"), b"<svg>3</svg>").unwrap();
        fs::write(job_dir.join("nested").join("ignored.svg"), b"x").unwrap();

        let out = write_job_archive(&job_dir, Cursor::new(Vec::new())).unwrap();
        let entries = read_zip(out.into_inner());

        assert_eq!(entries.len(), 2);
        assert_eq!(entries["frame_0000.svg"], b"<svg>0</svg>");
        assert_eq!(entries["frame_0003.svg"], b"<svg>3</svg>");
    }
}
