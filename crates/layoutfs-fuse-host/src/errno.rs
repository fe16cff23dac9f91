//! Translation of layout errors and open flags into kernel vocabulary

use layoutfs_core::{FsError, OpenOptions};
use libc::{c_int, EEXIST, EINVAL, EIO, ENOENT, EROFS};

pub fn errno(err: &FsError) -> c_int {
    match err {
        FsError::NotFound | FsError::Unmatched => ENOENT,
        FsError::ReadOnly => EROFS,
        FsError::AlreadyExists => EEXIST,
        FsError::InvalidArgument | FsError::InvalidPattern { .. } => EINVAL,
        FsError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        FsError::Watch(_) => EIO,
    }
}

/// Convert open(2) flags to OpenOptions
pub fn flags_to_options(flags: i32) -> OpenOptions {
    use libc::{O_ACCMODE, O_APPEND, O_CREAT, O_EXCL, O_RDWR, O_TRUNC, O_WRONLY};

    let mut options = OpenOptions::default();

    match flags & O_ACCMODE {
        O_RDWR => {
            options.read = true;
            options.write = true;
        }
        O_WRONLY => options.write = true,
        _ => options.read = true,
    }

    options.create = flags & O_CREAT != 0;
    options.create_new = flags & O_EXCL != 0;
    options.truncate = flags & O_TRUNC != 0;
    options.append = flags & O_APPEND != 0;
    options
}
