use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::application::AppDescription;
use crate::state::Role;
use crate::Result;

/// The manifest format this shop can understand
pub const ZAPP_MANIFEST_VERSION: u32 = 1;

/// Top level of `<shop>/<id>/manifest.json`
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ShopManifest {
    pub version: u32,
    pub zapps: Vec<ZAppEntry>,
}

/// One published application inside a manifest
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ZAppEntry {
    pub category: String,
    pub name: String,
    /// Markdown file with the long description, rendered by the UI
    pub readable_descr: String,
    /// JSON file with the application description
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ZAppParameter>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_logo")]
    pub logo: String,
    #[serde(default = "default_enabled_for")]
    pub enabled_for: Vec<String>,
    #[serde(default)]
    pub disabled_for: Vec<String>,
}

fn default_logo() -> String {
    "logo.png".to_string()
}

fn default_enabled_for() -> Vec<String> {
    vec!["all".to_string()]
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Int,
}

/// A knob the UI exposes before submitting a ZApp
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ZAppParameter {
    pub kind: String,
    pub name: String,
    pub readable_name: String,
    pub description: String,
    pub default: serde_json::Value,
    #[serde(rename = "type")]
    pub parameter_type: ParameterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A published application template, ready for the shop UI
#[derive(Serialize, Clone, Debug)]
pub struct ZApp {
    /// Directory name under the shop path
    pub id: String,
    pub manifest_index: usize,
    #[serde(flatten)]
    pub entry: ZAppEntry,
}

impl ZApp {
    fn visible_to(&self, role: &Role) -> bool {
        if role.can_access_full_zapp_shop {
            return true;
        }
        if self.entry.disabled_for.contains(&role.name) {
            return false;
        }
        self.entry.enabled_for.contains(&role.name) || self.entry.enabled_for.iter().any(|e| e == "all")
    }
}

fn read_file(path: &Path) -> Result<String> {
    let mut data = String::new();
    File::open(path)?.read_to_string(&mut data)?;
    Ok(data)
}

/// Read and decode one manifest; wrong versions yield an empty list
pub fn read_manifest(shop_path: &str, zapp_id: &str) -> Result<Vec<ZApp>> {
    let manifest_path: PathBuf = [shop_path, zapp_id, "manifest.json"].iter().collect();
    let manifest: ShopManifest = serde_json::from_str(&read_file(&manifest_path)?)?;
    if manifest.version != ZAPP_MANIFEST_VERSION {
        warn!(
            "Cannot load ZApp {}, only manifest version {} is understood",
            zapp_id, ZAPP_MANIFEST_VERSION
        );
        return Ok(Vec::new());
    }
    Ok(manifest
        .zapps
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| ZApp {
            id: zapp_id.to_string(),
            manifest_index: idx,
            entry,
        })
        .collect())
}

/// Scan the shop and return the ZApps a role can see, grouped by category
pub fn list_apps(shop_path: &str, role: &Role) -> Result<BTreeMap<String, Vec<ZApp>>> {
    let mut by_category: BTreeMap<String, Vec<ZApp>> = BTreeMap::new();
    for entry in WalkDir::new(shop_path)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        if !entry.path().join("manifest.json").is_file() {
            continue;
        }
        let zapp_id = entry.file_name().to_string_lossy().to_string();
        let zapps = match read_manifest(shop_path, &zapp_id) {
            Ok(z) => z,
            Err(e) => {
                warn!("Skipping ZApp directory {}: {}", zapp_id, e);
                continue;
            }
        };
        for zapp in zapps {
            if zapp.visible_to(role) {
                by_category.entry(zapp.entry.category.clone()).or_default().push(zapp);
            }
        }
    }
    Ok(by_category)
}

/// Load the application description a ZApp points at
pub fn load_description(shop_path: &str, zapp: &ZApp) -> Result<AppDescription> {
    let path: PathBuf = [shop_path, &zapp.id, &zapp.entry.description].iter().collect();
    let description: AppDescription = serde_json::from_str(&read_file(&path)?)?;
    description.verify()?;
    Ok(description)
}

/// The raw PNG logo for a ZApp
pub fn logo_bytes(shop_path: &str, zapp: &ZApp) -> Result<Vec<u8>> {
    let path: PathBuf = [shop_path, &zapp.id, &zapp.entry.logo].iter().collect();
    let mut data = Vec::new();
    File::open(&path)?.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_shop(dir: &Path) {
        let zapp_dir = dir.join("jupyter");
        fs::create_dir(&zapp_dir).unwrap();
        fs::write(
            zapp_dir.join("manifest.json"),
            r#"{
                "version": 1,
                "zapps": [{
                    "category": "Notebooks",
                    "name": "Jupyter",
                    "readable_descr": "README.md",
                    "description": "jupyter.json",
                    "parameters": [{
                        "kind": "environment",
                        "name": "mem",
                        "readable_name": "Memory",
                        "description": "Notebook memory",
                        "default": 4,
                        "type": "int",
                        "min": 1,
                        "max": 64,
                        "step": 1
                    }],
                    "disabled_for": ["guests"]
                }]
            }"#,
        )
        .unwrap();
        let stale = dir.join("stale");
        fs::create_dir(&stale).unwrap();
        fs::write(stale.join("manifest.json"), r#"{"version": 99, "zapps": []}"#).unwrap();
    }

    fn role(name: &str, full_shop: bool) -> Role {
        Role {
            id: 1,
            name: name.to_string(),
            can_see_status: true,
            can_change_config: false,
            can_operate_others: false,
            can_delete_executions: false,
            can_access_api: true,
            can_customize_resources: false,
            can_access_full_zapp_shop: full_shop,
        }
    }

    #[test]
    fn lists_by_category_and_filters_roles() {
        let dir = tempfile::tempdir().unwrap();
        write_shop(dir.path());
        let shop = dir.path().to_str().unwrap();

        let apps = list_apps(shop, &role("users", false)).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps["Notebooks"].len(), 1);
        assert_eq!(apps["Notebooks"][0].entry.parameters[0].parameter_type, ParameterType::Int);

        // disabled_for wins for normal roles, full shop access overrides it
        assert!(list_apps(shop, &role("guests", false)).unwrap().is_empty());
        assert_eq!(list_apps(shop, &role("guests", true)).unwrap().len(), 1);
    }

    #[test]
    fn unknown_manifest_version_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_shop(dir.path());
        let zapps = read_manifest(dir.path().to_str().unwrap(), "stale").unwrap();
        assert!(zapps.is_empty());
    }
}
