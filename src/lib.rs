pub mod auth;
pub mod config;
pub mod gcs;
pub mod remote;
pub mod store;

/// Reads the body of a response, turning non-success responses into an error
/// containing the body the server responded with
pub(crate) fn success_bytes(res: reqwest::blocking::Response) -> anyhow::Result<bytes::Bytes> {
    let code = res.status();
    let buffer = res.bytes()?;

    if code.is_success() {
        Ok(buffer)
    } else if let Ok(err_str) = String::from_utf8(buffer.into()) {
        anyhow::bail!("HTTP status {code}: {err_str}");
    } else {
        anyhow::bail!("failed to retrieve error for {code}");
    }
}

/// Converts a `reqwest::blocking::Response` into a vanilla `http::Response`,
/// copying the entire body into a single buffer
pub(crate) fn convert_response(
    res: reqwest::blocking::Response,
) -> anyhow::Result<http::Response<bytes::Bytes>> {
    use anyhow::Context as _;

    let mut builder = http::Response::builder()
        .status(res.status())
        .version(res.version());

    let headers = builder
        .headers_mut()
        .context("failed to convert response headers")?;

    headers.extend(
        res.headers()
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let body = res.bytes().context("failed to receive body")?;

    Ok(builder.body(body)?)
}

/// Writes a file only the current user can read, as it contains secrets
pub(crate) fn write_private(path: &camino::Utf8Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }

    let mut file = opts.open(path)?;

    // The mode only applies to newly created files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(data)
}
