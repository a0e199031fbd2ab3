use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::connection::SyncFilter;
use crate::error::FilterError;
use crate::identity::FileIdentity;
use crate::metadata::{PlaceholderRecord, PlaceholderState};

/// Placeholder operations over one sync root.
///
/// The store is stateless; every call resolves the record and the file
/// handles it needs and releases them before returning. Records live in the
/// filter, the bytes live in the client tree.
pub struct PlaceholderStore {
    filter: Arc<SyncFilter>,
    server_root: PathBuf,
    client_root: PathBuf,
}

impl PlaceholderStore {
    pub fn new(filter: Arc<SyncFilter>, server_root: PathBuf, client_root: PathBuf) -> Self {
        Self {
            filter,
            server_root,
            client_root,
        }
    }

    pub fn filter(&self) -> &Arc<SyncFilter> {
        &self.filter
    }

    pub fn server_root(&self) -> &Path {
        &self.server_root
    }

    pub fn client_root(&self) -> &Path {
        &self.client_root
    }

    /// The identity a placeholder at `client_abs` would carry: the
    /// server-relative path, which equals the client-relative one.
    pub fn identity_for(&self, client_abs: &Path) -> Result<FileIdentity, FilterError> {
        let relative = self.filter.relative_of(client_abs)?;
        Ok(FileIdentity::from_relative(&relative))
    }

    /// Creates (or refreshes) a placeholder mirroring one server entry.
    ///
    /// Directory placeholders are created with on-demand population disabled
    /// and their children are created eagerly. Creating over an existing
    /// entry refreshes its record instead of failing, so replayed remote
    /// events are harmless.
    pub fn create_single<'a>(
        &'a self,
        server_abs: &'a Path,
        client_abs: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), FilterError>> + Send + 'a>>
    {
        Box::pin(async move {
            let server_meta = match tokio::fs::metadata(server_abs).await {
                Ok(meta) => meta,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FilterError::MissingSource(server_abs.to_path_buf()));
                }
                Err(err) => return Err(err.into()),
            };
            let identity = self.identity_for(client_abs)?;

            if server_meta.is_dir() {
                tokio::fs::create_dir_all(client_abs).await?;
                let mut record = PlaceholderRecord::new(identity, true);
                record.mirror_times(&server_meta);
                record.state.is_in_sync = true;
                self.filter.write_record(client_abs, &record)?;

                let mut entries = tokio::fs::read_dir(server_abs).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let child_server = entry.path();
                    let child_client = client_abs.join(entry.file_name());
                    self.create_single(&child_server, &child_client).await?;
                }
                return Ok(());
            }

            let exists = tokio::fs::try_exists(client_abs).await?;
            if !exists {
                if let Some(parent) = client_abs.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                match tokio::fs::OpenOptions::new()
                    .create_new(true)
                    .write(true)
                    .open(client_abs)
                    .await
                {
                    Ok(_) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(err) => return Err(err.into()),
                }
            }

            let client_len = tokio::fs::metadata(client_abs)
                .await
                .map(|meta| meta.len())
                .unwrap_or(0);
            let mut record = PlaceholderRecord::new(identity, false);
            record.mirror_times(&server_meta);
            record.state.is_in_sync = true;
            // A user file that already carries content counts as hydrated.
            record.state.is_offline = client_len == 0;
            self.filter.write_record(client_abs, &record)?;
            Ok(())
        })
    }

    /// Breadth-first placeholder creation for initial population.
    ///
    /// Returns the number of entries created.
    pub async fn create_tree(
        &self,
        server_abs: &Path,
        relative_subdir: &str,
        client_abs: &Path,
    ) -> Result<usize, FilterError> {
        let mut created = 0usize;
        let mut queue: VecDeque<(PathBuf, PathBuf)> = VecDeque::new();
        let start_server = if relative_subdir.is_empty() {
            server_abs.to_path_buf()
        } else {
            server_abs.join(relative_subdir)
        };
        let start_client = if relative_subdir.is_empty() {
            client_abs.to_path_buf()
        } else {
            client_abs.join(relative_subdir)
        };
        tokio::fs::create_dir_all(&start_client).await?;
        queue.push_back((start_server, start_client));

        while let Some((server_dir, client_dir)) = queue.pop_front() {
            let mut entries = tokio::fs::read_dir(&server_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let child_server = entry.path();
                let child_client = client_dir.join(entry.file_name());
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    tokio::fs::create_dir_all(&child_client).await?;
                    let mut record =
                        PlaceholderRecord::new(self.identity_for(&child_client)?, true);
                    record.mirror_times(&meta);
                    record.state.is_in_sync = true;
                    self.filter.write_record(&child_client, &record)?;
                    queue.push_back((child_server, child_client));
                } else {
                    self.create_single(&child_server, &child_client).await?;
                }
                created += 1;
            }
        }
        Ok(created)
    }

    /// Removes an entry and its record; recursive for directories. Deleting
    /// an absent entry only clears the record.
    pub async fn delete(&self, client_abs: &Path) -> Result<(), FilterError> {
        match tokio::fs::metadata(client_abs).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(client_abs).await?,
            Ok(_) => tokio::fs::remove_file(client_abs).await?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.filter.remove_record(client_abs)
    }

    /// Moves an entry, bringing its record (and child records) along. The
    /// caller still owns the follow-up [`Self::update_identity`].
    pub async fn rename(
        &self,
        old_client_abs: &Path,
        new_client_abs: &Path,
    ) -> Result<(), FilterError> {
        if !tokio::fs::try_exists(old_client_abs).await? {
            return Err(FilterError::MissingSource(old_client_abs.to_path_buf()));
        }
        match tokio::fs::metadata(new_client_abs).await {
            Ok(meta) if meta.is_dir() => {
                return Err(FilterError::DestinationExists(new_client_abs.to_path_buf()));
            }
            Ok(_) => {
                // Overwrite semantics for files, matching the shell's
                // replace gesture.
                tokio::fs::remove_file(new_client_abs).await?;
                self.filter.remove_record(new_client_abs)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = new_client_abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(old_client_abs, new_client_abs).await?;
        self.filter.rename_record(old_client_abs, new_client_abs)
    }

    /// Flags the entry in sync. A regular file without a record is converted
    /// to a placeholder first, with its identity derived from its path.
    pub async fn mark_in_sync(&self, client_abs: &Path) -> Result<(), FilterError> {
        match self.filter.record(client_abs)? {
            Some(mut record) => {
                record.state.is_in_sync = true;
                if let Ok(meta) = tokio::fs::metadata(client_abs).await {
                    let logical_size = record.size;
                    record.mirror_times(&meta);
                    if record.state.is_offline {
                        // Dehydrated content lives on the server; keep the
                        // logical size.
                        record.size = logical_size;
                    }
                }
                self.filter.write_record(client_abs, &record)
            }
            None => {
                let identity = self.identity_for(client_abs)?;
                self.convert_to_placeholder(client_abs, identity).await
            }
        }
    }

    /// Flags the entry not in sync (the sync-arrows glyph). Touches only the
    /// record, never the content, so it cannot trigger hydration.
    pub fn mark_not_in_sync(&self, client_abs: &Path) -> Result<(), FilterError> {
        let mut record = self
            .filter
            .record(client_abs)?
            .ok_or_else(|| FilterError::NotAPlaceholder(client_abs.to_path_buf()))?;
        record.state.is_in_sync = false;
        self.filter.write_record(client_abs, &record)
    }

    /// Converts a regular file into a hydrated, in-sync placeholder without
    /// touching its content.
    pub async fn convert_to_placeholder(
        &self,
        client_abs: &Path,
        identity: FileIdentity,
    ) -> Result<(), FilterError> {
        let meta = match tokio::fs::metadata(client_abs).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FilterError::MissingSource(client_abs.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };
        let mut record = PlaceholderRecord::new(identity, meta.is_dir());
        record.mirror_times(&meta);
        record.size = if meta.is_dir() { 0 } else { meta.len() };
        record.state.is_in_sync = true;
        record.state.is_offline = false;
        self.filter.write_record(client_abs, &record)
    }

    /// Converts and releases the cached content in one pass.
    pub async fn convert_and_dehydrate(
        &self,
        client_abs: &Path,
        identity: FileIdentity,
    ) -> Result<(), FilterError> {
        self.convert_to_placeholder(client_abs, identity).await?;
        let mut record = self
            .filter
            .record(client_abs)?
            .ok_or_else(|| FilterError::NotAPlaceholder(client_abs.to_path_buf()))?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(client_abs)
            .await?;
        file.set_len(0).await?;
        record.state.is_offline = true;
        record.state.is_partially_hydrated = false;
        self.filter.write_record(client_abs, &record)
    }

    /// Materializes a byte range through the connected fetch callbacks.
    /// `length = -1` hydrates to the end of the file. Returns the bytes the
    /// terminal transfer covered.
    pub async fn hydrate(
        &self,
        client_abs: &Path,
        offset: u64,
        length: i64,
    ) -> Result<u64, FilterError> {
        let record = self
            .filter
            .record(client_abs)?
            .ok_or_else(|| FilterError::NotAPlaceholder(client_abs.to_path_buf()))?;
        let required = if length < 0 {
            record.size.saturating_sub(offset)
        } else {
            length as u64
        };
        let covered = self
            .filter
            .request_hydration(client_abs, offset, required)
            .await?;

        let mut record = self
            .filter
            .record(client_abs)?
            .ok_or_else(|| FilterError::NotAPlaceholder(client_abs.to_path_buf()))?;
        record.state.is_offline = false;
        record.state.is_partially_hydrated = !(offset == 0 && covered >= record.size);
        self.filter.write_record(client_abs, &record)?;
        Ok(covered)
    }

    /// Releases hydrated content. The entry must be an in-sync, unpinned
    /// placeholder; the protocol in the pin watcher walks entries into that
    /// state before calling this.
    pub async fn dehydrate(
        &self,
        client_abs: &Path,
        offset: u64,
        length: i64,
    ) -> Result<(), FilterError> {
        let mut record = self
            .filter
            .record(client_abs)?
            .ok_or_else(|| FilterError::NotAPlaceholder(client_abs.to_path_buf()))?;
        if !record.state.is_placeholder {
            return Err(FilterError::DehydrationRefused("not a placeholder"));
        }
        if !record.state.is_in_sync {
            return Err(FilterError::DehydrationRefused("not in sync"));
        }
        if record.state.is_pinned {
            return Err(FilterError::DehydrationRefused("pinned"));
        }

        let whole = offset == 0 && (length < 0 || length as u64 >= record.size);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(client_abs)
            .await?;
        if whole {
            file.set_len(0).await?;
            record.state.is_offline = true;
            record.state.is_partially_hydrated = false;
        } else {
            // Releasing a tail range keeps the leading bytes on disk.
            file.set_len(offset).await?;
            record.state.is_partially_hydrated = true;
        }
        self.filter.write_record(client_abs, &record)
    }

    /// Rewrites the stored identity after a rename so future hydration
    /// callbacks resolve the new server-relative path.
    pub fn update_identity(
        &self,
        client_abs: &Path,
        new_relative: &str,
    ) -> Result<(), FilterError> {
        let mut record = self
            .filter
            .record(client_abs)?
            .ok_or_else(|| FilterError::NotAPlaceholder(client_abs.to_path_buf()))?;
        record.identity = FileIdentity::from_relative(new_relative);
        self.filter.write_record(client_abs, &record)
    }

    pub fn state(&self, client_abs: &Path) -> Result<Option<PlaceholderState>, FilterError> {
        Ok(self.filter.record(client_abs)?.map(|record| record.state))
    }

    pub fn record(&self, client_abs: &Path) -> Result<Option<PlaceholderRecord>, FilterError> {
        self.filter.record(client_abs)
    }

    /// True when an entry's state says it was materialized by the provider
    /// rather than written by the user: offline, or a partially hydrated
    /// in-sync placeholder. Classification errors read as `false`.
    pub fn is_placeholder_only(&self, client_abs: &Path) -> bool {
        match self.filter.record(client_abs) {
            Ok(Some(record)) => {
                record.state.is_offline
                    || (record.state.is_placeholder
                        && record.state.is_in_sync
                        && record.state.is_partially_hydrated)
            }
            _ => false,
        }
    }
}
