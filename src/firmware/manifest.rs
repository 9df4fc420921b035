//! Upstream firmware catalogues.
//!
//! One catalogue per source: ArduPilot publishes a gzipped `manifest.json`
//! describing every build; PX4, Betaflight and iNav are queried through the
//! GitHub Releases API with per-source asset patterns. Catalogues are
//! cached in memory per process and re-fetched on demand.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::detect::boards as boardmap;
use crate::error::FirmwareError;
use crate::event::{Event, EventSender};

pub const ARDUPILOT_MANIFEST_URL: &str = "https://firmware.ardupilot.org/manifest.json.gz";
pub const GITHUB_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareSource {
    ArduPilot,
    Px4,
    Betaflight,
    Inav,
}

impl FirmwareSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArduPilot => "ardupilot",
            Self::Px4 => "px4",
            Self::Betaflight => "betaflight",
            Self::Inav => "inav",
        }
    }

    fn github_repo(self) -> Option<&'static str> {
        match self {
            Self::ArduPilot => None,
            Self::Px4 => Some("PX4/PX4-Autopilot"),
            Self::Betaflight => Some("betaflight/betaflight"),
            Self::Inav => Some("iNavFlight/inav"),
        }
    }

    /// Asset suffix that identifies a flashable artifact in a release.
    fn asset_suffix(self) -> &'static str {
        match self {
            Self::ArduPilot => ".apj",
            Self::Px4 => ".px4",
            Self::Betaflight | Self::Inav => ".hex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vehicle {
    Copter,
    Plane,
    Rover,
    Boat,
    Sub,
    Vtol,
}

impl Vehicle {
    /// VTOL builds ship under Plane; Boat under Rover.
    pub fn normalized(self) -> Self {
        match self {
            Self::Vtol => Self::Plane,
            Self::Boat => Self::Rover,
            other => other,
        }
    }

    fn ardupilot_name(self) -> &'static str {
        match self.normalized() {
            Self::Copter => "Copter",
            Self::Plane => "Plane",
            Self::Rover => "Rover",
            Self::Sub => "Sub",
            _ => unreachable!("normalized"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseType {
    Stable,
    Beta,
    Dev,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareVersion {
    pub source: FirmwareSource,
    pub board: String,
    pub version: String,
    pub release_type: ReleaseType,
    pub download_url: String,
    pub file_size: Option<u64>,
    pub git_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSummary {
    pub id: String,
    pub name: String,
    pub category: String,
    /// Modern firmware dropped this target.
    pub unsupported: bool,
    /// Newest legacy version still flashable when `unsupported`.
    pub legacy_version_bound: Option<&'static str>,
}

/// Versions of one board bucketed into `major.minor.x` groups, newest
/// first, with the latest stable flagged.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionGroup {
    pub group: String,
    pub versions: Vec<FirmwareVersion>,
    pub latest_stable: Option<usize>,
}

#[derive(Debug, Clone)]
struct Catalogue {
    boards: Vec<BoardSummary>,
    versions: Vec<FirmwareVersion>,
}

/// Fetches, parses and caches upstream board/version catalogues.
pub struct ManifestService {
    http: reqwest::Client,
    ardupilot_url: String,
    github_base: String,
    catalogues: Mutex<HashMap<(FirmwareSource, Option<&'static str>), Catalogue>>,
}

impl ManifestService {
    pub fn new() -> Self {
        Self::with_endpoints(ARDUPILOT_MANIFEST_URL, GITHUB_API_BASE)
    }

    /// The underlying HTTP client, shared with the download path so
    /// connection pools and the user agent stay consistent.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Endpoint override for tests and mirrors.
    pub fn with_endpoints(ardupilot_url: &str, github_base: &str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("groundlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client");
        Self {
            http,
            ardupilot_url: ardupilot_url.to_owned(),
            github_base: github_base.to_owned(),
            catalogues: Mutex::new(HashMap::new()),
        }
    }

    /// Boards available from `source` for `vehicle`, search over
    /// `{id, name, category}` with `query` (case-insensitive).
    pub async fn fetch_boards(
        &self,
        source: FirmwareSource,
        vehicle: Vehicle,
        query: Option<&str>,
    ) -> Result<Vec<BoardSummary>, FirmwareError> {
        let catalogue = self.catalogue(source, vehicle).await?;
        let mut boards = catalogue.boards;
        if let Some(query) = query {
            let query = query.to_ascii_lowercase();
            boards.retain(|b| {
                b.id.to_ascii_lowercase().contains(&query)
                    || b.name.to_ascii_lowercase().contains(&query)
                    || b.category.to_ascii_lowercase().contains(&query)
            });
        }
        Ok(boards)
    }

    /// Version groups for one board.
    pub async fn fetch_versions(
        &self,
        source: FirmwareSource,
        vehicle: Vehicle,
        board_id: &str,
    ) -> Result<Vec<VersionGroup>, FirmwareError> {
        let catalogue = self.catalogue(source, vehicle).await?;
        let versions: Vec<FirmwareVersion> = catalogue
            .versions
            .into_iter()
            .filter(|v| v.board.eq_ignore_ascii_case(board_id))
            .collect();
        if versions.is_empty() {
            return Err(FirmwareError::NoMatchingBoard);
        }
        Ok(group_versions(versions))
    }

    /// Translate a Betaflight target for an iNav flash. Emits
    /// `UnmatchedBoardWarning` when no mapping exists.
    pub async fn map_board_for_inav(
        &self,
        betaflight_target: &str,
        events: &EventSender,
    ) -> Option<&'static str> {
        let mapped = boardmap::inav_target_for(betaflight_target);
        if mapped.is_none() {
            events
                .emit(Event::UnmatchedBoardWarning {
                    board: betaflight_target.to_owned(),
                    wanted: "inav",
                })
                .await;
        }
        mapped
    }

    /// Download a firmware binary, returning the raw bytes.
    pub async fn download(&self, version: &FirmwareVersion) -> Result<Vec<u8>, FirmwareError> {
        let response = self
            .http
            .get(&version.download_url)
            .send()
            .await
            .map_err(|e| unreachable_source(version.source, e))?
            .error_for_status()
            .map_err(|e| unreachable_source(version.source, e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| unreachable_source(version.source, e))?;
        if let Some(expected) = version.file_size {
            if expected != bytes.len() as u64 {
                return Err(FirmwareError::BadImageFormat(format!(
                    "downloaded {} bytes, manifest said {expected}",
                    bytes.len()
                )));
            }
        }
        Ok(bytes.to_vec())
    }

    async fn catalogue(
        &self,
        source: FirmwareSource,
        vehicle: Vehicle,
    ) -> Result<Catalogue, FirmwareError> {
        let key = (
            source,
            match source {
                FirmwareSource::ArduPilot => Some(vehicle.ardupilot_name()),
                _ => None,
            },
        );
        let mut catalogues = self.catalogues.lock().await;
        if let Some(found) = catalogues.get(&key) {
            return Ok(found.clone());
        }
        let fetched = match source {
            FirmwareSource::ArduPilot => self.fetch_ardupilot(vehicle).await?,
            _ => self.fetch_github(source).await?,
        };
        catalogues.insert(key, fetched.clone());
        Ok(fetched)
    }

    async fn fetch_ardupilot(&self, vehicle: Vehicle) -> Result<Catalogue, FirmwareError> {
        let response = self
            .http
            .get(&self.ardupilot_url)
            .send()
            .await
            .map_err(|e| unreachable_source(FirmwareSource::ArduPilot, e))?
            .error_for_status()
            .map_err(|e| unreachable_source(FirmwareSource::ArduPilot, e))?;
        let raw = response
            .bytes()
            .await
            .map_err(|e| unreachable_source(FirmwareSource::ArduPilot, e))?;
        let manifest = parse_ardupilot_manifest(&raw)?;
        Ok(build_ardupilot_catalogue(manifest, vehicle))
    }

    async fn fetch_github(&self, source: FirmwareSource) -> Result<Catalogue, FirmwareError> {
        let repo = source.github_repo().expect("github-backed source");
        let url = format!("{}/repos/{repo}/releases?per_page=30", self.github_base);
        let releases: Vec<GithubRelease> = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| unreachable_source(source, e))?
            .error_for_status()
            .map_err(|e| unreachable_source(source, e))?
            .json()
            .await
            .map_err(|e| unreachable_source(source, e))?;
        Ok(build_github_catalogue(source, releases))
    }
}

impl Default for ManifestService {
    fn default() -> Self {
        Self::new()
    }
}

fn unreachable_source(source: FirmwareSource, e: reqwest::Error) -> FirmwareError {
    FirmwareError::ManifestUnreachable {
        origin: source.as_str(),
        reason: e.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ArduPilotManifest {
    firmware: Vec<ArduPilotFirmware>,
}

#[derive(Debug, Deserialize)]
struct ArduPilotFirmware {
    #[serde(rename = "mav-autopilot")]
    mav_autopilot: Option<String>,
    #[serde(rename = "vehicletype")]
    vehicle_type: Option<String>,
    #[serde(rename = "mav-firmware-version-type")]
    version_type: Option<String>,
    #[serde(rename = "mav-firmware-version")]
    version: Option<String>,
    platform: Option<String>,
    board_id: Option<u32>,
    format: Option<String>,
    url: Option<String>,
    #[serde(rename = "git-sha")]
    git_sha: Option<String>,
}

/// The manifest arrives gzipped; tolerate an uncompressed body too (test
/// servers and mirrors).
fn parse_ardupilot_manifest(raw: &[u8]) -> Result<ArduPilotManifest, FirmwareError> {
    let mut decoded = Vec::new();
    let body: &[u8] = if raw.starts_with(&[0x1F, 0x8B]) {
        flate2::read::GzDecoder::new(raw)
            .read_to_end(&mut decoded)
            .map_err(|e| FirmwareError::BadImageFormat(format!("manifest gzip: {e}")))?;
        &decoded
    } else {
        raw
    };
    serde_json::from_slice(body)
        .map_err(|e| FirmwareError::BadImageFormat(format!("manifest json: {e}")))
}

fn build_ardupilot_catalogue(manifest: ArduPilotManifest, vehicle: Vehicle) -> Catalogue {
    let wanted_vehicle = vehicle.ardupilot_name();
    let mut versions = Vec::new();
    let mut boards: BTreeMap<String, BoardSummary> = BTreeMap::new();
    for fw in manifest.firmware {
        if fw.mav_autopilot.as_deref() != Some("ARDUPILOTMEGA") {
            continue;
        }
        if !fw
            .vehicle_type
            .as_deref()
            .map_or(false, |v| v.eq_ignore_ascii_case(wanted_vehicle))
        {
            continue;
        }
        if fw.format.as_deref() != Some("apj") {
            continue;
        }
        let (Some(platform), Some(url), Some(version)) = (fw.platform, fw.url, fw.version) else {
            continue;
        };
        let release_type = match fw.version_type.as_deref() {
            Some("OFFICIAL") => ReleaseType::Stable,
            Some("BETA") => ReleaseType::Beta,
            _ => ReleaseType::Dev,
        };
        boards
            .entry(platform.clone())
            .or_insert_with(|| BoardSummary {
                id: fw
                    .board_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| platform.clone()),
                name: platform.clone(),
                category: "ardupilot".to_owned(),
                unsupported: false,
                legacy_version_bound: None,
            });
        versions.push(FirmwareVersion {
            source: FirmwareSource::ArduPilot,
            board: platform,
            version,
            release_type,
            download_url: url,
            file_size: None,
            git_hash: fw.git_sha,
        });
    }
    Catalogue {
        boards: boards.into_values().collect(),
        versions,
    }
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    prerelease: bool,
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    size: u64,
}

fn build_github_catalogue(source: FirmwareSource, releases: Vec<GithubRelease>) -> Catalogue {
    let suffix = source.asset_suffix();
    let mut versions = Vec::new();
    let mut boards: BTreeMap<String, BoardSummary> = BTreeMap::new();
    for release in releases {
        let version = release.tag_name.trim_start_matches('v').to_owned();
        let release_type = if release.prerelease {
            ReleaseType::Beta
        } else if version.contains("RC") || version.contains("rc") {
            ReleaseType::Beta
        } else {
            ReleaseType::Stable
        };
        for asset in release.assets {
            if !asset.name.ends_with(suffix) {
                continue;
            }
            let Some(target) = target_from_asset(source, &asset.name, &version) else {
                continue;
            };
            let unsupported =
                matches!(source, FirmwareSource::Betaflight | FirmwareSource::Inav)
                    && boardmap::is_f3_target(&target);
            boards.entry(target.clone()).or_insert_with(|| BoardSummary {
                id: target.clone(),
                name: target.clone(),
                category: source.as_str().to_owned(),
                unsupported,
                legacy_version_bound: boardmap::legacy_inav_bound(&target),
            });
            versions.push(FirmwareVersion {
                source,
                board: target.clone(),
                version: version.clone(),
                release_type,
                download_url: asset.browser_download_url,
                file_size: Some(asset.size),
                git_hash: None,
            });
        }
    }
    Catalogue {
        boards: boards.into_values().collect(),
        versions,
    }
}

/// Release assets are named `<product>_<version>_<TARGET>.<ext>` for
/// Betaflight/iNav and `<target>.px4`-style for PX4.
fn target_from_asset(source: FirmwareSource, asset: &str, version: &str) -> Option<String> {
    let stem = asset.rsplit_once('.')?.0;
    match source {
        FirmwareSource::Betaflight | FirmwareSource::Inav => {
            let marker = format!("_{version}_");
            match stem.find(&marker) {
                Some(at) => Some(stem[at + marker.len()..].to_owned()),
                // Older releases used <product>_<version>-<TARGET>
                None => stem.rsplit_once('_').map(|(_, t)| t.to_owned()),
            }
        }
        FirmwareSource::Px4 => Some(stem.trim_end_matches("_default").to_owned()),
        FirmwareSource::ArduPilot => Some(stem.to_owned()),
    }
}

/// Bucket into `major.minor.x` groups, newest group first, stable builds
/// before prereleases inside a group.
fn group_versions(mut versions: Vec<FirmwareVersion>) -> Vec<VersionGroup> {
    versions.sort_by(|a, b| semver_key(&b.version).cmp(&semver_key(&a.version)));
    let mut groups: Vec<VersionGroup> = Vec::new();
    for version in versions {
        let key = semver_key(&version.version);
        let group_name = format!("{}.{}.x", key.0, key.1);
        match groups.last_mut() {
            Some(last) if last.group == group_name => last.versions.push(version),
            _ => groups.push(VersionGroup {
                group: group_name,
                versions: vec![version],
                latest_stable: None,
            }),
        }
    }
    for group in &mut groups {
        group.latest_stable = group
            .versions
            .iter()
            .position(|v| v.release_type == ReleaseType::Stable);
    }
    groups
}

fn semver_key(version: &str) -> (u32, u32, u32) {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(v: &str, rt: ReleaseType) -> FirmwareVersion {
        FirmwareVersion {
            source: FirmwareSource::Betaflight,
            board: "MATEKF405".into(),
            version: v.into(),
            release_type: rt,
            download_url: String::new(),
            file_size: None,
            git_hash: None,
        }
    }

    #[test]
    fn versions_group_by_major_minor() {
        let groups = group_versions(vec![
            version("4.4.0", ReleaseType::Stable),
            version("4.5.0-RC1", ReleaseType::Beta),
            version("4.5.1", ReleaseType::Stable),
            version("4.4.2", ReleaseType::Stable),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group, "4.5.x");
        assert_eq!(groups[0].versions[0].version, "4.5.1");
        assert_eq!(groups[0].latest_stable, Some(0));
        assert_eq!(groups[1].group, "4.4.x");
        assert_eq!(groups[1].versions[0].version, "4.4.2");
    }

    #[test]
    fn betaflight_asset_names_resolve_to_targets() {
        assert_eq!(
            target_from_asset(
                FirmwareSource::Betaflight,
                "betaflight_4.4.2_MATEKF405.hex",
                "4.4.2"
            ),
            Some("MATEKF405".to_owned())
        );
        assert_eq!(
            target_from_asset(FirmwareSource::Px4, "px4_fmu-v5_default.px4", "1.14.0"),
            Some("px4_fmu-v5".to_owned())
        );
    }

    #[test]
    fn ardupilot_manifest_parses_and_filters() {
        let manifest = serde_json::json!({
            "format-version": "1.0.0",
            "firmware": [
                {
                    "mav-autopilot": "ARDUPILOTMEGA",
                    "vehicletype": "Copter",
                    "mav-firmware-version-type": "OFFICIAL",
                    "mav-firmware-version": "4.5.1",
                    "platform": "CubeOrange",
                    "board_id": 140,
                    "format": "apj",
                    "url": "https://example.invalid/copter.apj",
                    "git-sha": "abc123"
                },
                {
                    "mav-autopilot": "ARDUPILOTMEGA",
                    "vehicletype": "Plane",
                    "mav-firmware-version-type": "OFFICIAL",
                    "mav-firmware-version": "4.5.1",
                    "platform": "CubeOrange",
                    "format": "apj",
                    "url": "https://example.invalid/plane.apj"
                }
            ]
        });
        let parsed = parse_ardupilot_manifest(manifest.to_string().as_bytes()).unwrap();
        let catalogue = build_ardupilot_catalogue(parsed, Vehicle::Copter);
        assert_eq!(catalogue.versions.len(), 1);
        assert_eq!(catalogue.boards.len(), 1);
        assert_eq!(catalogue.versions[0].git_hash.as_deref(), Some("abc123"));
    }

    #[test]
    fn vtol_and_boat_normalise() {
        assert_eq!(Vehicle::Vtol.normalized(), Vehicle::Plane);
        assert_eq!(Vehicle::Boat.normalized(), Vehicle::Rover);
    }
}
