use anyhow::Context as _;
use reqwest::blocking::{Body, Client};
use tame_gcs::{self as tgcs, http};

/// Converts a vanilla `http::Request` into a `reqwest::blocking::Request`.
/// Bodies with a known length are streamed rather than buffered
fn convert_request<B>(
    req: http::Request<B>,
    client: &Client,
) -> anyhow::Result<reqwest::blocking::Request>
where
    B: std::io::Read + Send + 'static,
{
    let (parts, body) = req.into_parts();

    let uri = parts.uri.to_string();

    let builder = match parts.method {
        http::Method::GET => client.get(&uri),
        http::Method::POST => client.post(&uri),
        http::Method::DELETE => client.delete(&uri),
        http::Method::PATCH => client.patch(&uri),
        http::Method::PUT => client.put(&uri),
        method => anyhow::bail!("'{method}' not implemented"),
    };

    let body = match tame_gcs::util::get_content_length(&parts.headers) {
        Some(len) => Body::sized(body, len as u64),
        None => {
            let mut body = body;
            let mut buffer = Vec::new();
            std::io::copy(&mut body, &mut buffer).context("failed to read request body")?;
            Body::from(buffer)
        }
    };

    Ok(builder.headers(parts.headers).body(body).build()?)
}

/// Executes a GCS request via a reqwest client and returns the parsed response/API error
pub fn execute<B, R>(client: &Client, req: http::Request<B>) -> anyhow::Result<R>
where
    R: tgcs::ApiResponse<bytes::Bytes>,
    B: std::io::Read + Send + 'static,
{
    let request = convert_request(req, client)?;
    let response = client.execute(request).context("failed to send request")?;
    let response = crate::convert_response(response).context("failed to convert response")?;

    // Some failures, eg. from load balancers, are plain text rather than the
    // JSON error the API normally responds with
    if !response.status().is_success() {
        if let Some(ct) = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|hv| hv.to_str().ok())
        {
            if ct.starts_with("text/plain") {
                anyhow::bail!(
                    "request failed: HTTP status: {} -> {}",
                    response.status(),
                    std::str::from_utf8(response.body()).unwrap_or("text/plain body was not utf8")
                );
            }
        }
    }

    R::try_from_parts(response).context("API request failed")
}

#[inline]
pub fn bucket_name(bucket: &str) -> anyhow::Result<tgcs::BucketName<'static>> {
    tgcs::BucketName::try_from(bucket.to_owned())
        .with_context(|| format!("invalid bucket name '{bucket}'"))
}

#[inline]
pub fn object_name(object: &str) -> anyhow::Result<tgcs::ObjectName<'static>> {
    tgcs::ObjectName::try_from(object.to_owned())
        .with_context(|| format!("invalid object name '{object}'"))
}
