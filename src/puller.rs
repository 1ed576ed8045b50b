//! OCI/Docker registry v2 client and layer materializer.
//!
//! Fetches a manifest list, selects the manifest for the running platform, pulls the
//! image config and each layer blob, then unpacks layers into [`Layer`]s inside a freshly
//! unshared user namespace (mirroring the privilege-dropping the launcher itself uses).

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{fork, pipe, read as nix_read, ForkResult};
use regex::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::Error;
use crate::layer::Layer;
use crate::tar::TarReader;
use crate::userns;

const MANIFEST_LIST_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
];
const MANIFEST_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
];
const CONFIG_TYPES: &[&str] = &[
    "application/vnd.docker.container.image.v1+json",
    "application/vnd.oci.image.config.v1+json",
];
const LAYER_TYPES: &[&str] = &["application/vnd.docker.image.rootfs.diff.tar", "application/vnd.oci.image.layer.v1.tar"];
const LAYER_GZIP_TYPES: &[&str] = &[
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
    "application/vnd.oci.image.layer.v1.tar+gzip",
];

fn host_arch() -> (&'static str, &'static str) {
    match std::env::consts::ARCH {
        "x86_64" => ("amd64", ""),
        "aarch64" => ("arm64", "v8"),
        other => (other, ""),
    }
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
    os: String,
    #[serde(default)]
    variant: String,
}

#[derive(Deserialize)]
struct ManifestListEntry {
    digest: String,
    platform: Platform,
}

#[derive(Deserialize)]
struct ManifestList {
    #[serde(rename = "mediaType")]
    media_type: String,
    manifests: Vec<ManifestListEntry>,
}

#[derive(Deserialize)]
struct ManifestRef {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(rename = "mediaType")]
    media_type: String,
    config: ManifestRef,
    layers: Vec<ManifestRef>,
}

#[derive(Deserialize, Default)]
struct ImageConfigInner {
    #[serde(default)]
    #[serde(rename = "Entrypoint")]
    entrypoint: Vec<String>,
    #[serde(default)]
    #[serde(rename = "Cmd")]
    cmd: Vec<String>,
    #[serde(default)]
    #[serde(rename = "Env")]
    env: Vec<String>,
}

#[derive(Deserialize)]
struct ImageConfig {
    config: ImageConfigInner,
}

/// Parses `registry.host/name:reference` (or `registry.host/ns/name:reference`).
fn parse_reference(full_url: &str) -> Result<(String, String, String), Error> {
    let (host, rest) = full_url
        .split_once('/')
        .ok_or_else(|| Error::ConfigParse(format!("missing registry host in {full_url:?}")))?;
    let (name, reference) = rest
        .split_once(':')
        .ok_or_else(|| Error::ConfigParse(format!("missing :reference in {full_url:?}")))?;
    Ok((host.to_string(), name.to_string(), reference.to_string()))
}

struct Challenge {
    realm: String,
    params: Vec<(String, String)>,
}

/// Tolerantly parses a `Bearer realm="...",service="...",scope="..."` challenge:
/// fields may appear in any order, with or without trailing commas.
fn parse_challenge(header: &str) -> Option<Challenge> {
    if !header.trim_start().starts_with("Bearer") {
        return None;
    }
    let field_re = Regex::new(r#"(\w+)="([^"]*)""#).unwrap();
    let mut fields: Vec<(String, String)> = field_re
        .captures_iter(header)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    let realm_idx = fields.iter().position(|(k, _)| k == "realm")?;
    let realm = fields.remove(realm_idx).1;
    Some(Challenge { realm, params: fields })
}

fn reauthenticate(client: &Client, challenge: &Challenge) -> Result<String, Error> {
    let resp = client
        .get(&challenge.realm)
        .query(&challenge.params)
        .send()?;
    if !resp.status().is_success() {
        return Err(Error::RegistryAuth(format!(
            "token endpoint {} returned {}",
            challenge.realm,
            resp.status()
        )));
    }
    let body: HashMap<String, serde_json::Value> = resp.json()?;
    body.get("token")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::RegistryAuth("token response missing 'token'".into()))
}

/// Issues a GET with an `Accept` header, retrying once through the bearer-token dance if
/// the registry responds `401` with a `WWW-Authenticate: Bearer ...` challenge.
fn get_with_auth(client: &Client, url: &str, accept: &str, token: &mut Option<String>) -> Result<Response, Error> {
    for attempt in 0..2 {
        let mut req = client.get(url).header(ACCEPT, accept);
        if let Some(t) = token.as_ref() {
            req = req.bearer_auth(t);
        }
        let resp = req.send()?;
        if resp.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
            if let Some(challenge) = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_challenge)
            {
                *token = Some(reauthenticate(client, &challenge)?);
                continue;
            }
        }
        if !resp.status().is_success() {
            return Err(Error::RegistryAuth(format!("{url} -> {}", resp.status())));
        }
        return Ok(resp);
    }
    Err(Error::RegistryAuth(format!("{url}: exhausted auth retries")))
}

struct FetchedImage {
    host: String,
    name: String,
    manifest: Manifest,
    config: ImageConfig,
}

fn fetch_manifest_and_config(full_url: &str) -> Result<FetchedImage, Error> {
    let (host, name, reference) = parse_reference(full_url)?;
    let client = Client::builder().build()?;
    let mut token = None;

    log::info!("retrieving available manifests for {name}:{reference}");
    let list_url = format!("https://{host}/v2/{name}/manifests/{reference}");
    let resp = get_with_auth(&client, &list_url, &MANIFEST_LIST_TYPES.join(", "), &mut token)?;
    let manifest_list: ManifestList = resp.json()?;
    if !MANIFEST_LIST_TYPES.contains(&manifest_list.media_type.as_str()) {
        return Err(Error::ProtocolUnsupported(format!("media type {}", manifest_list.media_type)));
    }

    let (arch, variant) = host_arch();
    let entry = manifest_list.manifests.iter().find(|m| {
        m.platform.architecture == arch
            && m.platform.os == "linux"
            && (m.platform.variant == variant || (m.platform.variant.is_empty() && variant.is_empty()))
    });
    let entry = match entry {
        Some(e) => e,
        None => {
            let available = manifest_list
                .manifests
                .iter()
                .map(|m| format!("{}{}", m.platform.architecture, m.platform.variant))
                .collect();
            return Err(Error::ArchNotAvailable { available });
        }
    };

    log::info!("retrieving manifest {}", entry.digest);
    let manifest_url = format!("https://{host}/v2/{name}/manifests/{}", entry.digest);
    let resp = get_with_auth(&client, &manifest_url, &MANIFEST_TYPES.join(", "), &mut token)?;
    let manifest: Manifest = resp.json()?;
    if !MANIFEST_TYPES.contains(&manifest.media_type.as_str()) {
        return Err(Error::ProtocolUnsupported(format!("media type {}", manifest.media_type)));
    }
    if !CONFIG_TYPES.contains(&manifest.config.media_type.as_str()) {
        return Err(Error::ProtocolUnsupported(format!("media type {}", manifest.config.media_type)));
    }
    for layer in &manifest.layers {
        if !LAYER_TYPES.contains(&layer.media_type.as_str()) && !LAYER_GZIP_TYPES.contains(&layer.media_type.as_str()) {
            return Err(Error::ProtocolUnsupported(format!("media type {}", layer.media_type)));
        }
    }

    log::info!("retrieving configuration {}", manifest.config.digest);
    let config_url = format!("https://{host}/v2/{name}/blobs/{}", manifest.config.digest);
    let resp = get_with_auth(&client, &config_url, &CONFIG_TYPES.join(", "), &mut token)?;
    let config: ImageConfig = resp.json()?;

    Ok(FetchedImage { host, name, manifest, config })
}

fn digest_name(digest: &str) -> &str {
    digest.split_once(':').map(|(_, d)| d).unwrap_or(digest)
}

fn whiteout_target(root: &Path, entry_path: &str, basename: &str) -> PathBuf {
    let rel_dir = Path::new(entry_path).parent().unwrap_or_else(|| Path::new(""));
    root.join(rel_dir).join(&basename[4..])
}

fn materialize_layers(
    layerpath: &Path,
    host: &str,
    name: &str,
    manifest: &Manifest,
    config: &ImageConfig,
    full_url: &str,
) -> Result<(), Error> {
    let client = Client::builder().build()?;
    let mut parent: Option<Layer> = None;
    for layer_ref in &manifest.layers {
        let layer_name = digest_name(&layer_ref.digest).to_string();
        let lay = Layer::open(layerpath, &layer_name, parent.take())?;
        if lay.path.exists() {
            log::info!("skipping {} (already present)", layer_ref.digest);
            parent = Some(lay);
            continue;
        }
        log::info!("pulling {}", layer_ref.digest);
        lay.write()?;

        let mut token = None;
        let accept = format!("{}, {}", LAYER_TYPES.join(", "), LAYER_GZIP_TYPES.join(", "));
        let blob_url = format!("https://{host}/v2/{name}/blobs/{}", layer_ref.digest);
        let resp = get_with_auth(&client, &blob_url, &accept, &mut token)?;
        let is_gzip = LAYER_GZIP_TYPES.contains(&layer_ref.media_type.as_str());

        let root = lay.path.join("root");
        let reader: Box<dyn Read> = if is_gzip {
            Box::new(GzDecoder::new(resp))
        } else {
            Box::new(resp)
        };
        for entry in TarReader::new(reader) {
            let entry = entry?;
            let basename = entry.basename().to_string();
            if basename.starts_with(".wh.") {
                if basename == ".wh..wh..opq" {
                    return Err(Error::ProtocolUnsupported("opaque whiteouts are not implemented".into()));
                }
                let target = whiteout_target(&root, &entry.path, &basename);
                log::info!("removing {}", target.display());
                crate::mounts::make_whiteout_node(&target)?;
            } else {
                log::debug!("adding {}", entry.path);
                entry.write(&root)?;
            }
        }
        parent = Some(lay);
    }

    let top_name = name.rsplit('/').next().unwrap_or(name).to_string();
    log::info!("making {top_name}");
    let mut top = Layer::open(layerpath, &top_name, parent)?;
    let mut cmd = config.config.entrypoint.clone();
    cmd.extend(config.config.cmd.clone());
    top.set_cmd(&cmd);
    let env: Vec<(String, String)> = config
        .config
        .env
        .iter()
        .map(|v| {
            let (k, val) = v.split_once('=').unwrap_or((v.as_str(), ""));
            (k.to_string(), val.to_string())
        })
        .collect();
    top.set_env(env);
    top.set_url(full_url);
    top.set_ephemeral(true);
    top.write()?;
    Ok(())
}

/// Pulls `full_url` (`registry.host/name:reference`) into `layerpath`, materializing one
/// [`Layer`] per image layer plus a final ephemeral layer carrying the image's
/// entrypoint/cmd/env. The unpacking happens inside a freshly unshared user namespace, the
/// same privilege-dropping shape the launcher itself uses.
pub fn pull(full_url: &str, layerpath: &Path) -> Result<(), Error> {
    let image = fetch_manifest_and_config(full_url)?;

    let (r1, w1) = pipe()?;
    let (r2, w2) = pipe()?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            if let Err(err) = unshare(CloneFlags::CLONE_NEWUSER) {
                log::error!("unshare(CLONE_NEWUSER) failed: {err}");
                unsafe { nix::libc::_exit(1) };
            }
            drop(r1);
            drop(w1);
            drop(w2);
            let mut buf = [0u8; 1];
            let _ = nix_read(&r2, &mut buf);
            drop(r2);

            let result = materialize_layers(layerpath, &image.host, &image.name, &image.manifest, &image.config, full_url);
            match result {
                Ok(()) => unsafe { nix::libc::_exit(0) },
                Err(err) => {
                    log::error!("pull failed: {err}");
                    unsafe { nix::libc::_exit(1) }
                }
            }
        }
        ForkResult::Parent { child } => {
            drop(w1);
            let mut buf = [0u8; 1];
            let _ = nix_read(&r1, &mut buf);
            drop(r1);

            userns::map_current_user(child)?;

            drop(w2);
            drop(r2);

            match nix::sys::wait::waitpid(child, None)? {
                nix::sys::wait::WaitStatus::Exited(_, 0) => Ok(()),
                other => Err(Error::ChildCrashed(format!("{other:?}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference() {
        let (host, name, reference) = parse_reference("registry-1.docker.io/library/ubuntu:latest").unwrap();
        assert_eq!(host, "registry-1.docker.io");
        assert_eq!(name, "library/ubuntu");
        assert_eq!(reference, "latest");
    }

    #[test]
    fn parses_challenge_in_any_order() {
        let header = r#"Bearer service="registry.docker.io",realm="https://auth.docker.io/token",scope="repository:library/ubuntu:pull""#;
        let challenge = parse_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert!(challenge.params.iter().any(|(k, v)| k == "service" && v == "registry.docker.io"));
        assert!(challenge.params.iter().any(|(k, v)| k == "scope" && v == "repository:library/ubuntu:pull"));
    }

    #[test]
    fn maps_whiteout_path() {
        let root = Path::new("/layers/abc/root");
        let target = whiteout_target(root, "usr/lib/.wh.foo.so", ".wh.foo.so");
        assert_eq!(target, PathBuf::from("/layers/abc/root/usr/lib/foo.so"));
    }
}
