//! Streamline downloads - fetch compressed payloads and keep a JSON cache
//!
//! Cache layout: `<cache-dir>/<experiment-id>.json`. A file's existence is the
//! only cache-hit signal; entries are never invalidated.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::connectome::{ConnectomeSearch, ExperimentId, SearchParams};
use crate::error::{Result, StreamlineError};
use crate::frame::StreamlineFrame;

pub const DOWNLOADER_PAGE: &str =
    "https://neuroinformatics.nl/HBP/allen-connectivity-viewer/streamline-downloader.html";

/// Byte source for download URLs
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        tracing::debug!("Fetching from: {}", url);
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        tracing::debug!("Downloaded {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl<T: Fetch + ?Sized> Fetch for &T {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        (**self).fetch(url).await
    }
}

/// One resolved identifier: where it is cached and what it contains
#[derive(Debug, Clone)]
pub struct CachedStreamlines {
    pub id: ExperimentId,
    pub path: PathBuf,
    pub data: StreamlineFrame,
}

/// Result of reading an experiment CSV
#[derive(Debug)]
pub enum CsvIngest {
    /// Identifiers listed for manual download
    Ids(Vec<ExperimentId>),
    /// Identifiers forwarded to the downloader
    Downloaded(Vec<CachedStreamlines>),
}

/// Streamline data access: region search, CSV ingestion and cached downloads
pub struct StreamlinesApi<C, F> {
    connectome: C,
    fetcher: F,
    cache_dir: PathBuf,
    url_template: String,
}

impl<C: ConnectomeSearch, F: Fetch> StreamlinesApi<C, F> {
    pub fn new(connectome: C, fetcher: F, cache_dir: impl Into<PathBuf>, url_template: impl Into<String>) -> Self {
        Self {
            connectome,
            fetcher,
            cache_dir: cache_dir.into(),
            url_template: url_template.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Download URL for one experiment
    pub fn make_url_given_id(&self, id: ExperimentId) -> String {
        self.url_template.replace("{id}", &id.to_string())
    }

    /// Experiments injected in `region`, as reported by the connectome search
    pub async fn experiments_for_region(&self, region: &str, params: &SearchParams) -> Result<Vec<ExperimentId>> {
        self.connectome.experiments_source_search(region, params).await
    }

    /// Search experiments injected in `region` and download their streamlines
    pub async fn download_streamlines_for_region(
        &self,
        region: &str,
        params: &SearchParams,
    ) -> Result<Vec<CachedStreamlines>> {
        let ids = self.experiments_for_region(region, params).await?;
        self.download_streamlines(ids, None).await
    }

    /// Read experiment ids from a CSV exported from the connectivity atlas.
    ///
    /// Without `download`, prints download links and the comma-joined id list
    /// to stdout and returns the ids.
    pub async fn extract_ids_from_csv(&self, csv_file: &Path, download: bool) -> Result<CsvIngest> {
        let ids = read_ids_from_csv(csv_file)?;

        if download {
            let cached = self.download_streamlines(ids, None).await?;
            return Ok(CsvIngest::Downloaded(cached));
        }

        let stdout = std::io::stdout();
        self.write_download_instructions(&mut stdout.lock(), &ids)?;
        Ok(CsvIngest::Ids(ids))
    }

    /// Human-readable instructions for fetching `ids` by hand
    pub fn write_download_instructions<W: Write>(&self, out: &mut W, ids: &[ExperimentId]) -> Result<()> {
        writeln!(out, "Found {} experiments.\n", ids.len())?;
        writeln!(out, "To download compressed data, click on the following URLs:")?;
        for id in ids {
            writeln!(out, "{}", self.make_url_given_id(*id))?;
        }
        writeln!(out)?;
        writeln!(out, "To download JSON directly, go to: {}", DOWNLOADER_PAGE)?;
        writeln!(
            out,
            "and copy and paste the following experiments ID in the 'Enter the Allen Connectivity Experiment number:' field."
        )?;
        writeln!(out, "You can copy and paste each individually or a list of IDs separated by a comma")?;
        writeln!(out, "IDs: {}", join_ids(ids))?;
        writeln!(out)?;
        Ok(())
    }

    /// Resolve every id to a cache file, downloading the ones not cached yet.
    ///
    /// Ids are processed in order; the first failure aborts the batch.
    pub async fn download_streamlines<I>(
        &self,
        ids: I,
        streamlines_folder: Option<&Path>,
    ) -> Result<Vec<CachedStreamlines>>
    where
        I: IntoIterator<Item = ExperimentId>,
    {
        let folder = streamlines_folder.unwrap_or(self.cache_dir.as_path());
        std::fs::create_dir_all(folder)?;

        let mut resolved = Vec::new();
        for id in ids {
            let path = cache_path(folder, id);

            let data = if path.is_file() {
                tracing::info!("Streamlines {} found in cache", id);
                StreamlineFrame::read_json(&path)?
            } else {
                self.fetch_into_cache(id, folder, &path).await?
            };

            resolved.push(CachedStreamlines { id, path, data });
        }

        Ok(resolved)
    }

    async fn fetch_into_cache(&self, id: ExperimentId, folder: &Path, json_path: &Path) -> Result<StreamlineFrame> {
        let url = self.make_url_given_id(id);
        tracing::info!("Downloading streamlines for experiment {}", id);
        let bytes = self.fetcher.fetch(&url).await?;

        // Compressed payload goes through a temp file; it is left behind if parsing fails
        let temp_path = folder.join(format!("{}.json.gz.tmp", id));
        std::fs::write(&temp_path, &bytes)?;

        let data = StreamlineFrame::read_ndjson_gz(&temp_path)?;
        std::fs::remove_file(&temp_path)?;

        data.write_json(json_path)?;
        tracing::info!("Saved streamlines to {:?}", json_path);

        Ok(data)
    }
}

/// Cache file for one experiment
pub fn cache_path(folder: &Path, id: ExperimentId) -> PathBuf {
    folder.join(format!("{}.json", id))
}

/// Comma-joined id list, as accepted by the manual downloader page
pub fn join_ids(ids: &[ExperimentId]) -> String {
    ids.iter().map(ExperimentId::to_string).collect::<Vec<_>>().join(",")
}

/// Collect the `id` column of an experiment CSV
pub fn read_ids_from_csv(csv_file: &Path) -> Result<Vec<ExperimentId>> {
    let mut reader = csv::Reader::from_path(csv_file).map_err(|source| StreamlineError::CsvNotFound {
        path: csv_file.to_path_buf(),
        source,
    })?;

    let id_idx = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == "id")
        .ok_or_else(|| StreamlineError::MissingIdColumn {
            path: csv_file.to_path_buf(),
        })?;

    let mut ids = Vec::new();
    for record in reader.records() {
        let record = record?;
        let raw = record.get(id_idx).unwrap_or("");
        ids.push(raw.parse()?);
    }

    tracing::debug!("Read {} experiment ids from {:?}", ids.len(), csv_file);
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const TEMPLATE: &str = "https://example.org/json/streamlines_{id}.json.gz";

    struct FakeFetcher {
        payload: Vec<u8>,
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn new(payload: Vec<u8>) -> Self {
            Self {
                payload,
                calls: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            Ok(self.payload.clone())
        }
    }

    struct FixedSearch(Vec<ExperimentId>);

    #[async_trait]
    impl ConnectomeSearch for FixedSearch {
        async fn experiments_source_search(&self, _region: &str, _params: &SearchParams) -> Result<Vec<ExperimentId>> {
            Ok(self.0.clone())
        }
    }

    fn gzip_ndjson(record: &serde_json::Value) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        writeln!(encoder, "{}", record).unwrap();
        encoder.finish().unwrap()
    }

    fn sample_payload() -> Vec<u8> {
        gzip_ndjson(&json!({
            "lines": [[{"x": 0.0, "y": 0.0, "z": 0.0}, {"x": 1.0, "y": 1.0, "z": 1.0}]],
            "injection_sites": [{"x": 0.0, "y": 0.0, "z": 0.0}]
        }))
    }

    fn api<'f>(fetcher: &'f FakeFetcher, dir: &Path) -> StreamlinesApi<FixedSearch, &'f FakeFetcher> {
        StreamlinesApi::new(FixedSearch(vec![ExperimentId(7)]), fetcher, dir, TEMPLATE)
    }

    #[test]
    fn test_url_template() {
        let fetcher = FakeFetcher::new(Vec::new());
        let api = api(&fetcher, Path::new("unused"));
        assert_eq!(
            api.make_url_given_id(ExperimentId(100141219)),
            "https://example.org/json/streamlines_100141219.json.gz"
        );
    }

    #[tokio::test]
    async fn test_cache_miss_writes_json_and_removes_temp() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(sample_payload());
        let api = api(&fetcher, dir.path());

        let resolved = api.download_streamlines([ExperimentId(42)], None).await.unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].path, dir.path().join("42.json"));
        assert!(resolved[0].path.is_file());
        assert_eq!(resolved[0].data.num_rows(), 1);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(
            fetcher.urls.lock().unwrap().as_slice(),
            ["https://example.org/json/streamlines_42.json.gz".to_string()]
        );

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["42.json".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let dir = TempDir::new().unwrap();
        let cached = StreamlineFrame::from_value(json!({"lines": [[[{"x": 5.0, "y": 6.0, "z": 7.0}]]]})).unwrap();
        cached.write_json(&dir.path().join("9.json")).unwrap();

        let fetcher = FakeFetcher::new(sample_payload());
        let api = api(&fetcher, dir.path());

        let first = api.download_streamlines([ExperimentId(9)], None).await.unwrap();
        let second = api.download_streamlines([ExperimentId(9)], None).await.unwrap();

        assert_eq!(fetcher.calls(), 0);
        assert_eq!(first[0].data, cached);
        assert_eq!(second[0].data, cached);
    }

    #[tokio::test]
    async fn test_repeated_download_fetches_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(sample_payload());
        let api = api(&fetcher, dir.path());

        let first = api.download_streamlines([ExperimentId(3)], None).await.unwrap();
        let second = api.download_streamlines([ExperimentId(3)], None).await.unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(first[0].data, second[0].data);
    }

    #[tokio::test]
    async fn test_folder_override() {
        let default_dir = TempDir::new().unwrap();
        let other_dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(sample_payload());
        let api = api(&fetcher, default_dir.path());

        let resolved = api
            .download_streamlines([ExperimentId(1), ExperimentId(2)], Some(other_dir.path()))
            .await
            .unwrap();

        assert_eq!(resolved[0].path, other_dir.path().join("1.json"));
        assert_eq!(resolved[1].path, other_dir.path().join("2.json"));
        assert!(!default_dir.path().join("1.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_payload_aborts_batch() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(b"not json at all".to_vec());
        let api = api(&fetcher, dir.path());

        let result = api.download_streamlines([ExperimentId(1), ExperimentId(2)], None).await;

        assert!(matches!(result, Err(StreamlineError::Json(_))));
        assert_eq!(fetcher.calls(), 1);
        assert!(!dir.path().join("1.json").exists());
    }

    #[tokio::test]
    async fn test_region_download_uses_search_results() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(sample_payload());
        let api = api(&fetcher, dir.path());

        let resolved = api
            .download_streamlines_for_region("VISp", &SearchParams::default())
            .await
            .unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, ExperimentId(7));
    }

    #[tokio::test]
    async fn test_csv_without_download_lists_ids() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("experiments.csv");
        std::fs::write(&csv_path, "id,structure-abbrev\n1,VISp\n2,VISp\n3,MOs\n").unwrap();

        let fetcher = FakeFetcher::new(Vec::new());
        let api = api(&fetcher, dir.path());

        let ids = match api.extract_ids_from_csv(&csv_path, false).await.unwrap() {
            CsvIngest::Ids(ids) => ids,
            other => panic!("expected ids, got {:?}", other),
        };
        assert_eq!(ids, vec![ExperimentId(1), ExperimentId(2), ExperimentId(3)]);
        assert_eq!(join_ids(&ids), "1,2,3");
        assert_eq!(fetcher.calls(), 0);

        let mut out = Vec::new();
        api.write_download_instructions(&mut out, &ids).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Found 3 experiments."));
        assert!(text.contains("https://example.org/json/streamlines_2.json.gz"));
        assert!(text.contains("IDs: 1,2,3\n"));
    }

    #[tokio::test]
    async fn test_csv_with_download_forwards_ids() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("experiments.csv");
        std::fs::write(&csv_path, "name,id\na,11\nb,12\n").unwrap();

        let fetcher = FakeFetcher::new(sample_payload());
        let api = api(&fetcher, dir.path());

        match api.extract_ids_from_csv(&csv_path, true).await.unwrap() {
            CsvIngest::Downloaded(cached) => {
                let ids: Vec<_> = cached.iter().map(|c| c.id).collect();
                assert_eq!(ids, vec![ExperimentId(11), ExperimentId(12)]);
            }
            other => panic!("expected downloads, got {:?}", other),
        }
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_csv_is_not_found() {
        let fetcher = FakeFetcher::new(Vec::new());
        let api = api(&fetcher, Path::new("unused"));

        let err = api
            .extract_ids_from_csv(Path::new("/nonexistent/experiments.csv"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamlineError::CsvNotFound { .. }));
        assert_eq!(err.to_string(), "Could not load: /nonexistent/experiments.csv");
    }

    #[test]
    fn test_csv_without_id_column() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("bad.csv");
        std::fs::write(&csv_path, "experiment,region\n1,VISp\n").unwrap();

        assert!(matches!(
            read_ids_from_csv(&csv_path),
            Err(StreamlineError::MissingIdColumn { .. })
        ));
    }
}
