//! Device registry.
//!
//! The registry owns the mapping from logical names (`ExposureTime`,
//! `CamAcquire`, `RotationSpeed`, ...) to PV names and the transport used to
//! reach them. It is built once at startup:
//!
//! 1. every PV file entry is registered under its key;
//! 2. `*PVName` entries are read and the PV they name is registered under the
//!    key without the suffix (indirection: `RotationPVName` -> `Rotation`);
//! 3. `*PVPrefix` entries are read and remembered as prefixes;
//! 4. the mandatory schema (rotation, camera prefix, file plugin prefix) is
//!    checked, failing with `ScanError::Configuration`;
//! 5. motor-field, camera and file-plugin PVs are derived from those.
//!
//! Everything else in the crate talks to hardware through the typed accessors
//! here rather than raw PV names.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::{PvAccess, PvEntry, PvRole, PvValue};
use crate::error::{ScanError, ScanResult};

/// Logical names that must resolve before anything else can run.
pub const REQUIRED_PVS: [&str; 1] = ["Rotation"];
/// Prefixes that must resolve before anything else can run.
pub const REQUIRED_PREFIXES: [&str; 2] = ["Camera", "FilePlugin"];

const PV_NAME_SUFFIX: &str = "PVName";
const PV_PREFIX_SUFFIX: &str = "PVPrefix";

/// Rotation motor record fields.
const ROTATION_FIELDS: [(&str, &str); 14] = [
    ("RotationSpeed", ".VELO"),
    ("RotationMaxSpeed", ".VMAX"),
    ("RotationResolution", ".MRES"),
    ("RotationEResolution", ".ERES"),
    ("RotationSet", ".SET"),
    ("RotationStop", ".STOP"),
    ("RotationDmov", ".DMOV"),
    ("RotationDirection", ".DIR"),
    ("RotationAccelTime", ".ACCL"),
    ("RotationRBV", ".RBV"),
    ("RotationJog", ".JOGF"),
    ("RotationSpeedJog", ".JVEL"),
    ("RotationAccelJog", ".JAR"),
    ("RotationOFF", ".OFF"),
];

/// areaDetector driver PVs, relative to `<camera prefix>cam1:`.
const CAMERA_FIELDS: [(&str, &str); 18] = [
    ("CamAcquire", "Acquire"),
    ("CamAcquireBusy", "AcquireBusy"),
    ("CamImageMode", "ImageMode"),
    ("CamTriggerMode", "TriggerMode"),
    ("CamNumImages", "NumImages"),
    ("CamNumImagesCounter", "NumImagesCounter_RBV"),
    ("CamAcquireTime", "AcquireTime"),
    ("CamAcquireTimeRBV", "AcquireTime_RBV"),
    ("CamModel", "Model_RBV"),
    ("CamManufacturer", "Manufacturer_RBV"),
    ("CamTriggerSource", "TriggerSource"),
    ("CamTriggerOverlap", "TriggerOverlap"),
    ("CamExposureMode", "ExposureMode"),
    ("CamPixelFormat", "PixelFormat"),
    ("CamArrayCallbacks", "ArrayCallbacks"),
    ("CamFrameRateEnable", "FrameRateEnable"),
    ("CamTriggerSoftware", "TriggerSoftware"),
    ("CamVideoMode", "GC_VideoMode_RBV"),
];

/// File plugin PVs, relative to the file plugin prefix.
const FILE_PLUGIN_FIELDS: [(&str, &str); 16] = [
    ("FPCapture", "Capture"),
    ("FPCaptureRBV", "Capture_RBV"),
    ("FPNumCapture", "NumCapture"),
    ("FPNumCaptured", "NumCaptured_RBV"),
    ("FPFilePath", "FilePath"),
    ("FPFilePathRBV", "FilePath_RBV"),
    ("FPFilePathExists", "FilePathExists_RBV"),
    ("FPFileName", "FileName"),
    ("FPFileNameRBV", "FileName_RBV"),
    ("FPFileNumber", "FileNumber"),
    ("FPFileTemplate", "FileTemplate"),
    ("FPFullFileName", "FullFileName_RBV"),
    ("FPAutoSave", "AutoSave"),
    ("FPAutoIncrement", "AutoIncrement"),
    ("FPFileWriteMode", "FileWriteMode"),
    ("FPEnableCallbacks", "EnableCallbacks"),
];

/// Checked mapping from logical names to PVs plus the transport that serves them.
pub struct DeviceRegistry {
    access: Arc<dyn PvAccess>,
    names: HashMap<String, String>,
    config_keys: Vec<String>,
    prefixes: BTreeMap<String, String>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("pvs", &self.names.len())
            .field("config_keys", &self.config_keys.len())
            .field("prefixes", &self.prefixes)
            .finish()
    }
}

impl DeviceRegistry {
    /// Build the registry from parsed PV file entries.
    ///
    /// # Errors
    ///
    /// `ScanError::Configuration` when the rotation PV, camera prefix or file
    /// plugin prefix cannot be resolved, or when an indirection PV cannot be read.
    pub async fn connect(
        access: Arc<dyn PvAccess>,
        entries: &[PvEntry],
        connect_timeout: Duration,
    ) -> ScanResult<Self> {
        let mut registry = Self {
            access,
            names: HashMap::new(),
            config_keys: Vec::new(),
            prefixes: BTreeMap::new(),
        };

        for entry in entries {
            registry.names.insert(entry.key.clone(), entry.pv_name.clone());
            if entry.role == PvRole::Config && !registry.config_keys.contains(&entry.key) {
                registry.config_keys.push(entry.key.clone());
            }
        }

        for entry in entries {
            let indirect = entry.key.ends_with(PV_NAME_SUFFIX);
            let prefix = entry.key.ends_with(PV_PREFIX_SUFFIX);
            if !indirect && !prefix {
                continue;
            }
            if !registry.access.connect(&entry.pv_name, connect_timeout).await {
                error!(key = %entry.key, pv = %entry.pv_name, "indirection PV not connected");
                continue;
            }
            let value = registry.access.get_string(&entry.pv_name).await?;
            let value = value.trim().to_string();
            if indirect {
                let key = entry.key.trim_end_matches(PV_NAME_SUFFIX).to_string();
                if value.is_empty() {
                    warn!(key = %entry.key, "empty PV name; {} is not available", key);
                    continue;
                }
                info!(%key, pv = %value, "resolved PV indirection");
                registry.names.insert(key, value);
            } else {
                let key = entry.key.trim_end_matches(PV_PREFIX_SUFFIX).to_string();
                info!(%key, prefix = %value, "resolved PV prefix");
                registry.prefixes.insert(key, value);
            }
        }

        registry.check_schema()?;
        registry.derive_device_pvs();
        Ok(registry)
    }

    fn check_schema(&self) -> ScanResult<()> {
        let mut missing: Vec<String> = REQUIRED_PVS
            .iter()
            .filter(|key| !self.names.contains_key(**key))
            .map(|key| format!("{key}{PV_NAME_SUFFIX}"))
            .collect();
        missing.extend(
            REQUIRED_PREFIXES
                .iter()
                .filter(|key| self.prefixes.get(**key).map_or(true, |p| p.is_empty()))
                .map(|key| format!("{key}{PV_PREFIX_SUFFIX}")),
        );
        if missing.is_empty() {
            Ok(())
        } else {
            for key in &missing {
                error!(%key, "mandatory PV missing from configuration");
            }
            Err(ScanError::Configuration(format!(
                "mandatory PVs missing: {}",
                missing.join(", ")
            )))
        }
    }

    fn derive_device_pvs(&mut self) {
        if let Some(rotation) = self.names.get("Rotation").cloned() {
            for (key, field) in ROTATION_FIELDS {
                self.names.insert(key.to_string(), format!("{rotation}{field}"));
            }
        }
        if let Some(camera) = self.prefixes.get("Camera").cloned() {
            for (key, field) in CAMERA_FIELDS {
                self.names.insert(key.to_string(), format!("{camera}cam1:{field}"));
            }
        }
        if let Some(plugin) = self.prefixes.get("FilePlugin").cloned() {
            for (key, field) in FILE_PLUGIN_FIELDS {
                self.names.insert(key.to_string(), format!("{plugin}{field}"));
            }
        }
    }

    /// Try to connect every registered PV; log and return the ones that fail.
    pub async fn check_connected(&self, timeout: Duration) -> Vec<String> {
        let mut keys: Vec<&String> = self.names.keys().collect();
        keys.sort();
        let mut disconnected = Vec::new();
        for key in keys {
            let pv = &self.names[key];
            if !self.access.connect(pv, timeout).await {
                error!(%key, %pv, "PV not connected");
                disconnected.push(pv.clone());
            }
        }
        disconnected
    }

    /// Fail with `ScanError::Disconnected` unless every PV connects.
    pub async fn require_connected(&self, timeout: Duration) -> ScanResult<()> {
        let pvs = self.check_connected(timeout).await;
        if pvs.is_empty() {
            Ok(())
        } else {
            Err(ScanError::Disconnected { pvs })
        }
    }

    /// PV name for a logical key.
    pub fn pv_name(&self, key: &str) -> ScanResult<&str> {
        self.names
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ScanError::Configuration(format!("PV '{key}' is not configured")))
    }

    /// Whether a logical key is configured.
    pub fn has(&self, key: &str) -> bool {
        self.names.contains_key(key)
    }

    /// A resolved `*PVPrefix` value.
    pub fn prefix(&self, key: &str) -> Option<&str> {
        self.prefixes.get(key).map(String::as_str)
    }

    /// Keys persisted in configuration snapshots, in file order.
    pub fn config_keys(&self) -> &[String] {
        &self.config_keys
    }

    /// The underlying transport.
    pub fn access(&self) -> &Arc<dyn PvAccess> {
        &self.access
    }

    /// Read a value.
    pub async fn get(&self, key: &str) -> ScanResult<PvValue> {
        self.access.get(self.pv_name(key)?).await
    }

    /// Read a numeric value.
    pub async fn get_float(&self, key: &str) -> ScanResult<f64> {
        let pv = self.pv_name(key)?;
        let value = self.access.get(pv).await?;
        value
            .as_f64()
            .ok_or_else(|| ScanError::pv(pv, format!("expected a number, got '{value}'")))
    }

    /// Read an integer value.
    pub async fn get_int(&self, key: &str) -> ScanResult<i64> {
        let pv = self.pv_name(key)?;
        let value = self.access.get(pv).await?;
        value
            .as_i64()
            .ok_or_else(|| ScanError::pv(pv, format!("expected an integer, got '{value}'")))
    }

    /// Read a display string.
    pub async fn get_string(&self, key: &str) -> ScanResult<String> {
        self.access.get_string(self.pv_name(key)?).await
    }

    /// Write without waiting.
    pub async fn put(&self, key: &str, value: impl Into<PvValue>) -> ScanResult<()> {
        self.access.put(self.pv_name(key)?, value.into()).await
    }

    /// Write and wait for completion.
    pub async fn put_and_wait(
        &self,
        key: &str,
        value: impl Into<PvValue>,
        timeout: Duration,
    ) -> ScanResult<()> {
        self.access
            .put_and_wait(self.pv_name(key)?, value.into(), timeout)
            .await
    }

    /// Monitor a logical PV.
    pub fn subscribe(&self, key: &str) -> ScanResult<broadcast::Receiver<PvValue>> {
        self.access.subscribe(self.pv_name(key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::file::{parse_pv_file, Macros};
    use crate::pv::sim::SimulatedIoc;

    const FILE: &str = "\
$(P)$(R)RotationPVName
$(P)$(R)CameraPVPrefix
$(P)$(R)FilePluginPVPrefix
$(P)$(R)SampleXPVName
#controlPV $(P)$(R)ScanStatus
";

    fn entries() -> Vec<PvEntry> {
        parse_pv_file(FILE, &Macros::new().with("P", "2bma:").with("R", "TomoScan:"))
    }

    async fn seeded() -> Arc<SimulatedIoc> {
        let ioc = SimulatedIoc::new();
        ioc.seed("2bma:TomoScan:RotationPVName", "2bma:m82");
        ioc.seed("2bma:TomoScan:CameraPVPrefix", "2bmbSP1:");
        ioc.seed("2bma:TomoScan:FilePluginPVPrefix", "2bmbSP1:HDF1:");
        ioc.seed("2bma:TomoScan:SampleXPVName", "");
        ioc
    }

    #[tokio::test]
    async fn resolves_indirection_and_derives_device_pvs() {
        let ioc = seeded().await;
        let registry = DeviceRegistry::connect(ioc, &entries(), Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(registry.pv_name("Rotation").unwrap(), "2bma:m82");
        assert_eq!(registry.pv_name("RotationSpeed").unwrap(), "2bma:m82.VELO");
        assert_eq!(registry.pv_name("RotationOFF").unwrap(), "2bma:m82.OFF");
        assert_eq!(
            registry.pv_name("CamNumImagesCounter").unwrap(),
            "2bmbSP1:cam1:NumImagesCounter_RBV"
        );
        assert_eq!(
            registry.pv_name("FPFullFileName").unwrap(),
            "2bmbSP1:HDF1:FullFileName_RBV"
        );
        // empty indirection is skipped, not fatal
        assert!(!registry.has("SampleX"));
        // control PVs are not persisted
        assert!(!registry.config_keys().contains(&"ScanStatus".to_string()));
        assert!(registry.config_keys().contains(&"RotationPVName".to_string()));
    }

    #[tokio::test]
    async fn missing_mandatory_prefix_is_fatal() {
        let ioc = seeded().await;
        ioc.seed("2bma:TomoScan:FilePluginPVPrefix", "");
        let err = DeviceRegistry::connect(ioc, &entries(), Duration::from_millis(10))
            .await
            .unwrap_err();
        match err {
            ScanError::Configuration(message) => assert!(message.contains("FilePluginPVPrefix")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_every_disconnected_pv() {
        let beamline = crate::pv::sim::SimBeamline::new();
        beamline.ioc.set_offline("2bma:m82.VELO", true);
        beamline.ioc.set_offline("2bmbSP1:cam1:Acquire", true);
        let registry = beamline.registry(Duration::from_millis(10)).await.unwrap();

        let disconnected = registry.check_connected(Duration::from_millis(10)).await;
        assert_eq!(disconnected, vec!["2bmbSP1:cam1:Acquire", "2bma:m82.VELO"]);
        assert!(matches!(
            registry.require_connected(Duration::from_millis(10)).await,
            Err(ScanError::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_keys_are_configuration_errors() {
        let ioc = seeded().await;
        let registry = DeviceRegistry::connect(ioc, &entries(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(
            registry.get_float("NoSuchThing").await,
            Err(ScanError::Configuration(_))
        ));
    }
}
