use std::path::{Path, MAIN_SEPARATOR};

use crate::error::IResult;
use crate::storage::{write_string_to_file, Storage};

/// The kinds of files that make up a database directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// `CURRENT`: one line naming the live manifest.
    Current,
    /// `LOCK`: the advisory single-writer lock.
    Lock,
    /// `LOG` / `LOG.old`: informational text logs written by other
    /// implementations; recognized so cleanup leaves them alone.
    InfoLog,
    OldInfoLog,
    /// `MANIFEST-<n>`: the version-edit journal.
    Manifest,
    /// `<n>.log`: write-ahead logs.
    Log,
    /// `<n>.ldb` (or legacy `<n>.sst`): tables.
    Table,
    /// `<n>.dbtmp`: scratch files that are renamed into place.
    Temp,
}

/// The path of a database file of the given type and number.
pub fn generate_filename(db_path: &str, file_type: FileType, number: u64) -> String {
    match file_type {
        FileType::Current => format!("{}{}CURRENT", db_path, MAIN_SEPARATOR),
        FileType::Lock => format!("{}{}LOCK", db_path, MAIN_SEPARATOR),
        FileType::InfoLog => format!("{}{}LOG", db_path, MAIN_SEPARATOR),
        FileType::OldInfoLog => format!("{}{}LOG.old", db_path, MAIN_SEPARATOR),
        FileType::Manifest => format!("{}{}MANIFEST-{:06}", db_path, MAIN_SEPARATOR, number),
        FileType::Log => format!("{}{}{:06}.log", db_path, MAIN_SEPARATOR, number),
        FileType::Table => format!("{}{}{:06}.ldb", db_path, MAIN_SEPARATOR, number),
        FileType::Temp => format!("{}{}{:06}.dbtmp", db_path, MAIN_SEPARATOR, number),
    }
}

/// The path of a table file with the legacy `.sst` extension. Readers
/// fall back to it; the writer never produces it.
pub fn generate_legacy_table_filename(db_path: &str, number: u64) -> String {
    format!("{}{}{:06}.sst", db_path, MAIN_SEPARATOR, number)
}

/// Classifies a file name (the final path component). Returns the type
/// and the file number (0 for un-numbered files).
pub fn parse_filename<P: AsRef<Path>>(path: P) -> Option<(FileType, u64)> {
    let name = path.as_ref().file_name()?.to_str()?;
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        "LOG" => return Some((FileType::InfoLog, 0)),
        "LOG.old" => return Some((FileType::OldInfoLog, 0)),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number: u64 = rest.parse().ok()?;
        return Some((FileType::Manifest, number));
    }
    let dot = name.find('.')?;
    let number: u64 = name[..dot].parse().ok()?;
    match &name[dot + 1..] {
        "log" => Some((FileType::Log, number)),
        "ldb" | "sst" => Some((FileType::Table, number)),
        "dbtmp" => Some((FileType::Temp, number)),
        _ => None,
    }
}

/// Atomically points `CURRENT` at `MANIFEST-<manifest_number>` by
/// writing a temp file and renaming it into place.
pub fn update_current<S: Storage>(storage: &S, db_path: &str, manifest_number: u64) -> IResult<()> {
    let contents = format!("MANIFEST-{:06}\n", manifest_number);
    let tmp = generate_filename(db_path, FileType::Temp, manifest_number);
    let result = write_string_to_file(storage, &contents, &tmp, true).and_then(|()| {
        storage.rename(&tmp, &generate_filename(db_path, FileType::Current, 0))
    });
    if result.is_err() {
        let _ = storage.remove(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mem::MemStorage;
    use crate::storage::read_string_from_file;

    #[test]
    fn test_generate_and_parse_roundtrip() {
        let cases = [
            (FileType::Current, 0),
            (FileType::Lock, 0),
            (FileType::InfoLog, 0),
            (FileType::OldInfoLog, 0),
            (FileType::Manifest, 7),
            (FileType::Log, 100),
            (FileType::Table, 123456),
            (FileType::Temp, 42),
        ];
        for (t, n) in cases {
            let name = generate_filename("db", t, n);
            assert_eq!(parse_filename(&name), Some((t, n)), "{}", name);
        }
    }

    #[test]
    fn test_parse_accepts_legacy_sst() {
        assert_eq!(
            parse_filename(generate_legacy_table_filename("db", 9)),
            Some((FileType::Table, 9))
        );
        assert_eq!(parse_filename("db/000123.sst"), Some((FileType::Table, 123)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for name in [
            "",
            "foo",
            "foo-dx-100.log",
            ".log",
            "100",
            "100.",
            "100.abc",
            "MANIFEST",
            "MANIFEST-",
            "MANIFEST-abc",
            "CURRENT.tmp",
        ] {
            assert_eq!(parse_filename(name), None, "{:?}", name);
        }
    }

    #[test]
    fn test_parse_large_numbers() {
        let name = format!("{}.log", u64::MAX);
        assert_eq!(parse_filename(&name), Some((FileType::Log, u64::MAX)));
        // Overflowing numbers are not files we own.
        assert_eq!(parse_filename("184467440737095516160.log"), None);
    }

    #[test]
    fn test_update_current() {
        let storage = MemStorage::new();
        update_current(&storage, "db", 5).unwrap();
        let contents =
            read_string_from_file(&storage, generate_filename("db", FileType::Current, 0)).unwrap();
        assert_eq!(contents, "MANIFEST-000005\n");
        assert!(!storage.exists(generate_filename("db", FileType::Temp, 5)));
        // Repointing replaces the old contents.
        update_current(&storage, "db", 6).unwrap();
        let contents =
            read_string_from_file(&storage, generate_filename("db", FileType::Current, 0)).unwrap();
        assert_eq!(contents, "MANIFEST-000006\n");
    }
}
