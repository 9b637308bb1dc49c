//! [`Storage`] implemented on top of the GCS JSON API

mod util;

use crate::{
    auth::Authenticator,
    store::{Media, Storage},
};
use anyhow::Context as _;
use tame_gcs::{self as tgcs, objects::Metadata};
use tracing::debug;

const API_URL: &str = "https://storage.googleapis.com/storage/v1";

#[derive(serde::Deserialize)]
struct BucketResource {
    id: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketList {
    #[serde(default)]
    items: Vec<BucketResource>,
    next_page_token: Option<String>,
}

#[derive(serde::Serialize)]
struct NewBucket<'a> {
    name: &'a str,
}

#[derive(serde::Serialize)]
struct ObjectAccessControl<'a> {
    entity: &'a str,
    role: &'a str,
}

/// Builds an API url, each segment is percent encoded so that eg. object
/// names containing `/` are addressed correctly
fn api_url(segments: &[&str]) -> anyhow::Result<url::Url> {
    let mut url = url::Url::parse(API_URL)?;
    url.path_segments_mut()
        .map_err(|()| anyhow::anyhow!("invalid api url"))?
        .extend(segments);
    Ok(url)
}

/// Accesses GCS with a session that is only authenticated when the first
/// request is made
pub struct Gcs {
    auth: Authenticator,
    obj: tgcs::objects::Object,
}

impl Gcs {
    pub fn new(auth: Authenticator) -> Self {
        Self {
            auth,
            obj: tgcs::objects::Object::default(),
        }
    }
}

impl Storage for Gcs {
    fn authenticate(&mut self) -> anyhow::Result<()> {
        self.auth.session().map(|_| ())
    }

    /// <https://cloud.google.com/storage/docs/json_api/v1/buckets/get>
    fn get_bucket(&mut self, bucket: &str) -> anyhow::Result<()> {
        let client = self.auth.session()?.client();
        let res = client
            .get(api_url(&["b", bucket])?)
            .send()
            .context("failed to send request")?;

        let body = crate::success_bytes(res)
            .with_context(|| format!("failed to get bucket '{bucket}'"))?;
        let bucket: BucketResource =
            serde_json::from_slice(&body).context("failed to deserialize bucket")?;
        debug!(bucket = %bucket.id, "bucket exists");

        Ok(())
    }

    /// <https://cloud.google.com/storage/docs/json_api/v1/buckets/insert>
    fn insert_bucket(&mut self, project: &str, bucket: &str) -> anyhow::Result<()> {
        let mut url = api_url(&["b"])?;
        url.query_pairs_mut().append_pair("project", project);

        let client = self.auth.session()?.client();
        let res = client
            .post(url)
            .json(&NewBucket { name: bucket })
            .send()
            .context("failed to send request")?;

        crate::success_bytes(res)
            .with_context(|| format!("failed to create bucket '{bucket}' in '{project}'"))?;
        Ok(())
    }

    fn insert_object(
        &mut self,
        bucket: &str,
        object: &str,
        content: std::fs::File,
        len: u64,
    ) -> anyhow::Result<()> {
        let bucket_name = util::bucket_name(bucket)?;
        let md = Metadata {
            name: Some(object.to_owned()),
            content_type: Some("application/octet-stream".to_owned()),
            ..Default::default()
        };

        let req = self.obj.insert_multipart(&bucket_name, content, len, &md, None)?;

        let client = self.auth.session()?.client();
        let _res: tgcs::objects::InsertResponse = util::execute(client, req)
            .with_context(|| format!("failed to upload '{object}' to '{bucket}'"))?;

        Ok(())
    }

    fn object_media_link(
        &mut self,
        bucket: &str,
        object: &str,
    ) -> anyhow::Result<(String, Option<u64>)> {
        let bucket_name = util::bucket_name(bucket)?;
        let object_name = util::object_name(object)?;

        let req = self.obj.get(&(&bucket_name, &object_name), None)?;

        let client = self.auth.session()?.client();
        let res: tgcs::objects::GetObjectResponse = util::execute(client, req)
            .with_context(|| format!("failed to get metadata for '{object}'"))?;

        let link = res
            .metadata
            .media_link
            .with_context(|| format!("object '{object}' has no media link"))?;

        Ok((link, res.metadata.size))
    }

    fn open_media(&mut self, link: &str) -> anyhow::Result<Media> {
        let client = self.auth.session()?.client();
        let res = client
            .get(link)
            .send()
            .context("failed to send request")?;

        let code = res.status();
        if !code.is_success() {
            let body = res.text().unwrap_or_default();
            anyhow::bail!("failed to download object: HTTP status {code}: {body}");
        }

        Ok(Media {
            len: res.content_length(),
            body: Box::new(res),
        })
    }

    /// <https://cloud.google.com/storage/docs/json_api/v1/buckets/list>
    fn list_buckets(&mut self, project: &str) -> anyhow::Result<Vec<String>> {
        let client = self.auth.session()?.client();

        let mut buckets = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = api_url(&["b"])?;
            {
                let mut qp = url.query_pairs_mut();
                qp.append_pair("project", project);
                if let Some(pt) = &page_token {
                    qp.append_pair("pageToken", pt);
                }
            }

            let res = client.get(url).send().context("failed to send request")?;
            let body = crate::success_bytes(res)
                .with_context(|| format!("failed to list buckets in '{project}'"))?;
            let list: BucketList =
                serde_json::from_slice(&body).context("failed to deserialize bucket list")?;

            buckets.extend(list.items.into_iter().map(|b| b.id));

            page_token = list.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(buckets)
    }

    fn list_objects(&mut self, bucket: &str) -> anyhow::Result<Vec<String>> {
        let bucket_name = util::bucket_name(bucket)?;
        let client = self.auth.session()?.client();

        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let req = self.obj.list(
                &bucket_name,
                Some(tgcs::objects::ListOptional {
                    page_token: page_token.as_deref(),
                    ..Default::default()
                }),
            )?;

            let res: tgcs::objects::ListResponse = util::execute(client, req)
                .with_context(|| format!("failed to list objects in '{bucket}'"))?;

            objects.extend(res.objects.into_iter().filter_map(|md| md.name));

            page_token = res.page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(objects)
    }

    /// <https://cloud.google.com/storage/docs/json_api/v1/objectAccessControls/insert>
    fn insert_object_acl(
        &mut self,
        bucket: &str,
        object: &str,
        entity: &str,
        role: &str,
    ) -> anyhow::Result<()> {
        let client = self.auth.session()?.client();
        let res = client
            .post(api_url(&["b", bucket, "o", object, "acl"])?)
            .json(&ObjectAccessControl { entity, role })
            .send()
            .context("failed to send request")?;

        crate::success_bytes(res)
            .with_context(|| format!("failed to grant {role} on '{object}' to {entity}"))?;
        Ok(())
    }
}
