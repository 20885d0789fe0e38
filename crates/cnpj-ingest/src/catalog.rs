//! Archive catalog resolver
//!
//! The registry publishes each release as a plain HTTP directory listing.
//! Discovery parses the `<a href>` entries of that page rather than any
//! particular markup structure, so cosmetic page changes (Apache vs nginx
//! listings, added columns) do not break resolution: an entry counts if its
//! link target ends in `.zip`.
//!
//! Each archive is classified into its logical table by filename infix;
//! entries matching no known pattern (layout PDFs, signature files) are
//! skipped and reported, never fatal. Resolution is pure discovery with no
//! side effects.

use std::time::Duration;

use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{PipelineConfig, USER_AGENT};
use crate::dictionary::TableKind;
use crate::error::{IngestError, Result};

/// One remotely published archive, classified into its logical table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDescriptor {
    /// Absolute download URL
    pub url: Url,
    /// Archive file name, as listed in the catalog
    pub file_name: String,
    /// The logical table this archive contributes to
    pub table: TableKind,
}

/// Outcome of catalog resolution
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Recognized archives, ordered by file name for deterministic runs
    pub archives: Vec<ArchiveDescriptor>,
    /// Listing entries that matched no known table pattern
    pub skipped: Vec<String>,
}

/// Resolves the set of published archives from the catalog index page
pub struct CatalogResolver {
    client: Client,
    catalog_url: Url,
}

impl CatalogResolver {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let catalog_url = Url::parse(&config.catalog_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| IngestError::CatalogUnavailable {
                url: config.catalog_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            catalog_url,
        })
    }

    /// Fetch the index page and classify its archive listing.
    ///
    /// Fails with [`IngestError::CatalogUnavailable`] when the page cannot
    /// be fetched; nothing can run without a catalog.
    pub async fn resolve(&self) -> Result<Resolution> {
        info!(url = %self.catalog_url, "resolving archive catalog");

        let html = self.fetch_index().await?;
        let resolution = self.classify_listing(&html)?;

        info!(
            archives = resolution.archives.len(),
            skipped = resolution.skipped.len(),
            "catalog resolved"
        );

        Ok(resolution)
    }

    async fn fetch_index(&self) -> Result<String> {
        let unavailable = |reason: String| IngestError::CatalogUnavailable {
            url: self.catalog_url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(self.catalog_url.clone())
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(unavailable(format!("HTTP {}", response.status())));
        }

        response.text().await.map_err(|e| unavailable(e.to_string()))
    }

    fn classify_listing(&self, html: &str) -> Result<Resolution> {
        let document = Html::parse_document(html);
        // Directory listings differ across servers; the links are the only
        // stable structure.
        let link_selector =
            Selector::parse("a").map_err(|e| IngestError::CatalogUnavailable {
                url: self.catalog_url.to_string(),
                reason: format!("selector: {}", e),
            })?;

        let mut resolution = Resolution::default();

        for element in document.select(&link_selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            // Sort-order links and the parent-directory entry are not files
            if href.starts_with('?') || href == "../" {
                continue;
            }

            let file_name = href.rsplit('/').next().unwrap_or(href).to_string();
            if !file_name.to_lowercase().ends_with(".zip") {
                debug!(entry = %file_name, "ignoring non-archive listing entry");
                continue;
            }

            match TableKind::from_file_name(&file_name) {
                Some(table) => {
                    let url = self.catalog_url.join(href)?;
                    resolution.archives.push(ArchiveDescriptor {
                        url,
                        file_name,
                        table,
                    });
                }
                None => {
                    warn!(
                        error = %IngestError::UnrecognizedArchiveName(file_name.clone()),
                        "skipping catalog entry"
                    );
                    resolution.skipped.push(file_name);
                }
            }
        }

        resolution.archives.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        resolution.skipped.sort();

        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LISTING: &str = r#"
        <html><body><pre>
        <a href="../">../</a>
        <a href="?C=N;O=D">Name</a>
        <a href="Empresas0.zip">Empresas0.zip</a>
        <a href="Empresas1.zip">Empresas1.zip</a>
        <a href="Estabelecimentos0.zip">Estabelecimentos0.zip</a>
        <a href="Cnaes.zip">Cnaes.zip</a>
        <a href="LAYOUT.pdf">LAYOUT.pdf</a>
        <a href="Tecnologia.zip">Tecnologia.zip</a>
        </pre></body></html>
    "#;

    fn test_config(url: &str) -> PipelineConfig {
        PipelineConfig {
            catalog_url: url.to_string(),
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_and_classifies_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING))
            .mount(&server)
            .await;

        let resolver = CatalogResolver::new(&test_config(&server.uri())).unwrap();
        let resolution = resolver.resolve().await.unwrap();

        let names: Vec<_> = resolution
            .archives
            .iter()
            .map(|a| a.file_name.as_str())
            .collect();
        assert_eq!(
            names,
            ["Cnaes.zip", "Empresas0.zip", "Empresas1.zip", "Estabelecimentos0.zip"]
        );
        assert_eq!(resolution.archives[1].table, TableKind::Companies);
        assert_eq!(
            resolution.archives[1].url.as_str(),
            format!("{}/Empresas0.zip", server.uri())
        );
        // Unknown archives are skipped, non-archives silently ignored
        assert_eq!(resolution.skipped, ["Tecnologia.zip"]);
    }

    #[tokio::test]
    async fn http_failure_is_catalog_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let resolver = CatalogResolver::new(&test_config(&server.uri())).unwrap();
        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, IngestError::CatalogUnavailable { .. }));
    }

    #[tokio::test]
    async fn unreachable_host_is_catalog_unavailable() {
        // Nothing listens on port 1; the connection is refused immediately
        let resolver =
            CatalogResolver::new(&test_config("http://127.0.0.1:1/listing/")).unwrap();
        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, IngestError::CatalogUnavailable { .. }));
    }
}
