use core::ops::RangeFrom;
use std::{
    borrow::Cow,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use bytesize::ByteSize;
use im::OrdMap;
use itertools::Either;
use libmdbx::{DatabaseFlags, Environment, Geometry, WriteFlags};
use log::debug;
use tap::Pipe as _;
use unwrap_none::UnwrapNone as _;

const GROWTH_STEP: ByteSize = ByteSize::mib(256);
const MAX_NAMED_DATABASES: usize = 8;

#[derive(Clone, Copy)]
pub enum DatabaseMode {
    ReadOnly,
    ReadWrite,
}

impl DatabaseMode {
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }

    // <https://erthink.github.io/libmdbx/group__c__opening.html#gabb7dd3b10dd31639ba252df545e11768>
    // Zero means open an existing environment without creating files.
    #[must_use]
    const fn mode_permissions(self) -> u16 {
        match self {
            Self::ReadOnly => 0,
            Self::ReadWrite => 0o600,
        }
    }

    #[cfg(target_os = "linux")]
    fn permissions(self) -> u32 {
        self.mode_permissions().into()
    }

    #[cfg(not(target_os = "linux"))]
    const fn permissions(self) -> u16 {
        self.mode_permissions()
    }
}

/// Ordered byte-keyed store with an in-memory and a `libmdbx` backend.
///
/// Every method that takes a batch runs it in a single transaction.
/// Values are stored as given. Callers compress them if they want to.
pub struct Database(DatabaseKind);

impl Database {
    pub fn persistent(
        name: &str,
        directory: impl AsRef<Path>,
        max_size: ByteSize,
        mode: DatabaseMode,
    ) -> Result<Self> {
        if !mode.is_read_only() {
            fs_err::create_dir_all(&directory)?;
        }

        let environment = Environment::builder()
            .set_max_dbs(MAX_NAMED_DATABASES)
            .set_geometry(Geometry {
                size: Some(..usize::try_from(max_size.as_u64())?),
                growth_step: Some(isize::try_from(GROWTH_STEP.as_u64())?),
                shrink_threshold: None,
                page_size: None,
            })
            .open_with_permissions(directory.as_ref(), mode.permissions())?;

        if !mode.is_read_only() {
            let transaction = environment.begin_rw_txn()?;
            transaction.create_db(Some(name), DatabaseFlags::default())?;
            transaction.commit()?;
        }

        debug!("opened database {name} in {}", directory.as_ref().display());

        Ok(Self(DatabaseKind::Persistent {
            database_name: name.to_owned(),
            environment,
        }))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self(DatabaseKind::InMemory {
            map: Mutex::default(),
        })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let mut values = self.get_batch(core::iter::once(key))?;
        Ok(values.pop().flatten())
    }

    /// Looks up every key against the same snapshot.
    ///
    /// The result has one entry per key, in the order the keys were given.
    pub fn get_batch(
        &self,
        keys: impl IntoIterator<Item = impl AsRef<[u8]>>,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                keys.into_iter()
                    .map(|key| -> Result<_> {
                        let value = transaction
                            .get::<Cow<_>>(database.dbi(), key.as_ref())?
                            .map(Cow::into_owned);

                        Ok(value)
                    })
                    .collect()
            }
            DatabaseKind::InMemory { map } => {
                let map = map
                    .lock()
                    .expect("in-memory database mutex is poisoned")
                    .clone();

                keys.into_iter()
                    .map(|key| map.get(key.as_ref()).map(|value| value.to_vec()))
                    .map(Ok)
                    .collect()
            }
        }
    }

    #[expect(clippy::type_complexity)]
    pub fn iterator_ascending(
        &self,
        range: RangeFrom<impl AsRef<[u8]>>,
    ) -> Result<impl Iterator<Item = Result<(Cow<[u8]>, Vec<u8>)>>> {
        let start = range.start.as_ref();

        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                cursor
                    .set_range(start)
                    .transpose()
                    .into_iter()
                    .chain(core::iter::from_fn(move || cursor.next().transpose()))
                    .map(|result| {
                        let (key, value): (Cow<[u8]>, Cow<[u8]>) = result?;
                        Ok((key, value.into_owned()))
                    })
                    .pipe(Either::Left)
            }
            DatabaseKind::InMemory { map } => {
                let map = map.lock().expect("in-memory database mutex is poisoned");
                let start_pair = map.get_key_value(start);
                let (_, mut above) = map.split(start);

                if let Some((key, value)) = start_pair {
                    above
                        .insert(Arc::clone(key), Arc::clone(value))
                        .expect_none("start_pair should have been discarded by OrdMap::split");
                }

                above
                    .into_iter()
                    .map(|(key, value)| Ok((Cow::Owned(key.to_vec()), value.to_vec())))
                    .pipe(Either::Right)
            }
        }
        .pipe(Ok)
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.put_batch(core::iter::once((key, value)))
    }

    pub fn put_batch(
        &self,
        pairs: impl IntoIterator<Item = (impl AsRef<[u8]>, impl AsRef<[u8]>)>,
    ) -> Result<()> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                for (key, value) in pairs {
                    transaction.put(
                        database.dbi(),
                        key.as_ref(),
                        value.as_ref(),
                        WriteFlags::default(),
                    )?;
                }

                transaction.commit()?;
            }
            DatabaseKind::InMemory { map } => {
                // Mutate a copy so that a panic midway leaves the map untouched.
                let mut map = map.lock().expect("in-memory database mutex is poisoned");
                let mut new_map = map.clone();

                for (key, value) in pairs {
                    new_map.insert(key.as_ref().into(), value.as_ref().into());
                }

                *map = new_map;
            }
        }

        Ok(())
    }

    pub fn delete_batch(&self, keys: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Result<()> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                for key in keys {
                    if cursor.set::<()>(key.as_ref())?.is_some() {
                        cursor.del(WriteFlags::default())?;
                    }
                }

                transaction.commit()?;
            }
            DatabaseKind::InMemory { map } => {
                let mut map = map.lock().expect("in-memory database mutex is poisoned");
                let mut new_map = map.clone();

                for key in keys {
                    new_map.remove(key.as_ref());
                }

                *map = new_map;
            }
        }

        Ok(())
    }

    /// Deletes every pair for which `keep` returns `false` and returns how many were deleted.
    ///
    /// Nothing is deleted if `keep` fails.
    pub fn retain(&self, mut keep: impl FnMut(&[u8], &[u8]) -> Result<bool>) -> Result<usize> {
        let mut deleted = 0;

        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;
                let mut entry = cursor.first::<Cow<[u8]>, Cow<[u8]>>()?;

                while let Some((key, value)) = entry {
                    if !keep(&key, &value)? {
                        cursor.del(WriteFlags::default())?;
                        deleted += 1;
                    }

                    entry = cursor.next()?;
                }

                transaction.commit()?;
            }
            DatabaseKind::InMemory { map } => {
                let mut map = map.lock().expect("in-memory database mutex is poisoned");
                let mut new_map = map.clone();

                for (key, value) in map.iter() {
                    if !keep(&**key, &**value)? {
                        new_map.remove(key);
                        deleted += 1;
                    }
                }

                *map = new_map;
            }
        }

        Ok(deleted)
    }

    const fn kind(&self) -> &DatabaseKind {
        &self.0
    }
}

enum DatabaseKind {
    Persistent {
        database_name: String,
        environment: Environment,
    },
    InMemory {
        // `OrdMap` clones its elements when split or copied, so they must be cheap to clone.
        map: Mutex<InMemoryMap>,
    },
}

type InMemoryMap = OrdMap<Arc<[u8]>, Arc<[u8]>>;

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;

    type Constructor = fn() -> Result<(Database, Option<TempDir>)>;

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_get_batch_preserves_key_order(constructor: Constructor) -> Result<()> {
        let (database, _directory) = constructor()?;

        let values = database.get_batch(["E", "D", "A"])?;

        assert_eq!(values, [Some(to_bytes("5")), None, Some(to_bytes("1"))]);
        assert_eq!(database.get("C")?, Some(to_bytes("3")));
        assert_eq!(database.get("F")?, None);

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_delete_batch(constructor: Constructor) -> Result<()> {
        let (database, _directory) = constructor()?;

        database.delete_batch(["C", "D", "A"])?;

        assert_pairs_eq(database.iterator_ascending("0"..)?, [("B", "2"), ("E", "5")])?;

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_iterator_ascending(constructor: Constructor) -> Result<()> {
        let (database, _directory) = constructor()?;

        assert_pairs_eq(
            database.iterator_ascending("0"..)?,
            [("A", "1"), ("B", "2"), ("C", "3"), ("E", "5")],
        )?;

        assert_pairs_eq(
            database.iterator_ascending("B"..)?,
            [("B", "2"), ("C", "3"), ("E", "5")],
        )?;

        assert_pairs_eq(database.iterator_ascending("D"..)?, [("E", "5")])?;
        assert_pairs_eq(database.iterator_ascending("F"..)?, [])?;

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_multiple_of_the_same_key(constructor: Constructor) -> Result<()> {
        let (database, _directory) = constructor()?;

        database.put_batch([("A", "1"), ("A", "2"), ("A", "3")])?;

        assert_eq!(database.get("A")?, Some(to_bytes("3")));

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_retain_deletes_rejected_pairs(constructor: Constructor) -> Result<()> {
        let (database, _directory) = constructor()?;

        let deleted = database.retain(|key, value| Ok(key != b"B" && value != b"5"))?;

        assert_eq!(deleted, 2);
        assert_pairs_eq(database.iterator_ascending("0"..)?, [("A", "1"), ("C", "3")])?;

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_retain_failure_deletes_nothing(constructor: Constructor) -> Result<()> {
        let (database, _directory) = constructor()?;

        let result = database.retain(|key, _| {
            if key == b"C" {
                bail!("cannot decide about C");
            }

            Ok(false)
        });

        assert!(result.is_err());
        assert_pairs_eq(
            database.iterator_ascending("0"..)?,
            [("A", "1"), ("B", "2"), ("C", "3"), ("E", "5")],
        )?;

        Ok(())
    }

    #[test_case(build_persistent_database)]
    #[test_case(build_in_memory_database)]
    fn test_isolation(constructor: Constructor) -> Result<()> {
        let (database, _directory) = constructor()?;
        let iterator = database.iterator_ascending("A"..)?;

        database.delete_batch(["A", "B", "C", "E"])?;

        assert_pairs_eq(iterator, [("A", "1"), ("B", "2"), ("C", "3"), ("E", "5")])?;

        Ok(())
    }

    #[test]
    fn test_persistent_database_survives_reopening() -> Result<()> {
        let directory = TempDir::new()?;

        Database::persistent(
            "test_db",
            directory.path(),
            ByteSize::mib(1),
            DatabaseMode::ReadWrite,
        )?
        .put("A", "1")?;

        let reopened = Database::persistent(
            "test_db",
            directory.path(),
            ByteSize::mib(1),
            DatabaseMode::ReadWrite,
        )?;

        assert_eq!(reopened.get("A")?, Some(to_bytes("1")));

        Ok(())
    }

    fn build_persistent_database() -> Result<(Database, Option<TempDir>)> {
        let directory = TempDir::new()?;

        let database = Database::persistent(
            "test_db",
            directory.path(),
            ByteSize::mib(1),
            DatabaseMode::ReadWrite,
        )?;

        populate_database(&database)?;
        Ok((database, Some(directory)))
    }

    fn build_in_memory_database() -> Result<(Database, Option<TempDir>)> {
        let database = Database::in_memory();
        populate_database(&database)?;
        Ok((database, None))
    }

    fn populate_database(database: &Database) -> Result<()> {
        database.put_batch([("A", "1"), ("B", "2"), ("C", "3")])?;
        database.put("E", "5")?;
        Ok(())
    }

    fn assert_pairs_eq<'strings>(
        actual_pairs: impl IntoIterator<Item = Result<(impl AsRef<[u8]>, impl AsRef<[u8]>)>>,
        expected_pairs: impl IntoIterator<Item = (&'strings str, &'strings str)>,
    ) -> Result<()> {
        let actual_pairs = to_string_pairs(actual_pairs)?;
        let expected_pairs = to_string_pairs(expected_pairs.into_iter().map(Ok))?;

        assert_eq!(actual_pairs, expected_pairs);

        Ok(())
    }

    fn to_string_pairs(
        pairs: impl IntoIterator<Item = Result<(impl AsRef<[u8]>, impl AsRef<[u8]>)>>,
    ) -> Result<Vec<(String, String)>> {
        pairs
            .into_iter()
            .map(|result| {
                let (key, value) = result?;
                let key_string = core::str::from_utf8(key.as_ref())?;
                let value_string = core::str::from_utf8(value.as_ref())?;
                Ok((key_string.to_owned(), value_string.to_owned()))
            })
            .collect()
    }

    fn to_bytes(string: &str) -> Vec<u8> {
        string.as_bytes().to_vec()
    }
}
