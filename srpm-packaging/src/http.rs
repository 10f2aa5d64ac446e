// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::error::{Result, SrpmPackagingError},
    reqwest::blocking::Client,
    std::path::Path,
    url::Url,
};

/// Build the HTTP client used for remote source hydration.
///
/// The system root store is always trusted. An extra CA certificate can be
/// appended from a PEM file, and a client identity loaded from a PEM
/// certificate/key pair.
pub fn build_client(
    extra_ca_cert: Option<&Path>,
    client_identity: Option<(&Path, &Path)>,
) -> Result<Client> {
    let mut builder = Client::builder().use_rustls_tls();

    if let Some(ca_path) = extra_ca_cert {
        let pem = std::fs::read(ca_path)
            .map_err(|e| SrpmPackagingError::IoPath(ca_path.display().to_string(), e))?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }

    if let Some((cert_path, key_path)) = client_identity {
        let mut pem = std::fs::read(cert_path)
            .map_err(|e| SrpmPackagingError::IoPath(cert_path.display().to_string(), e))?;
        let key = std::fs::read(key_path)
            .map_err(|e| SrpmPackagingError::IoPath(key_path.display().to_string(), e))?;
        pem.extend_from_slice(&key);

        builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
    }

    Ok(builder.build()?)
}

/// Join a file name onto a server base URL.
pub fn join_url(base: &str, file_name: &str) -> Result<String> {
    // Trailing slashes are significant to Url::join(); without one the last
    // path segment would be replaced instead of appended.
    let mut base_url = Url::parse(base)?;
    if !base_url.path().ends_with('/') {
        base_url.set_path(&format!("{}/", base_url.path()));
    }

    Ok(base_url.join(file_name)?.to_string())
}

/// Fetch a URL and write the body to `destination`.
pub fn download_file(client: &Client, url: &str, destination: &Path) -> Result<()> {
    let response = client.get(url).send()?;

    if !response.status().is_success() {
        return Err(SrpmPackagingError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let data = response.bytes()?;

    std::fs::write(destination, &data)
        .map_err(|e| SrpmPackagingError::IoPath(destination.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_appends_segment() {
        assert_eq!(
            join_url("https://example.com/sources", "foo.tar.gz").unwrap(),
            "https://example.com/sources/foo.tar.gz"
        );
        assert_eq!(
            join_url("https://example.com/sources/", "foo.tar.gz").unwrap(),
            "https://example.com/sources/foo.tar.gz"
        );
    }

    #[test]
    fn test_join_url_rejects_garbage() {
        assert!(join_url("not a url", "foo.tar.gz").is_err());
    }
}
