use std::collections::HashSet;

/// Static package classification consumed by the cleanup features.
pub trait PackagePolicy: Send + Sync {
    /// May stay on a device cleaned in allowlist mode.
    fn is_allowed(&self, package: &str) -> bool;
    fn is_bloatware(&self, package: &str) -> bool;
    /// Never uninstalled or disabled, whatever the mode.
    fn is_critical(&self, package: &str) -> bool;
}

const SYSTEM_CRITICAL: &[&str] = &[
    "android",
    "com.android.systemui",
    "com.android.settings",
    "com.android.phone",
    "com.android.server.telecom",
    "com.android.providers.telephony",
    "com.android.providers.settings",
    "com.android.providers.media",
    "com.android.providers.downloads",
    "com.android.providers.contacts",
    "com.android.providers.calendar",
    "com.android.providers.blockednumber",
    "com.android.providers.userdictionary",
    "com.android.packageinstaller",
    "com.android.permissioncontroller",
    "com.android.keychain",
    "com.android.certinstaller",
    "com.android.carrierconfig",
    "com.android.carrierdefaultapp",
    "com.android.localtransport",
    "com.android.location.fused",
    "com.android.inputdevices",
    "com.android.bluetooth",
    "com.android.bluetoothmidiservice",
    "com.android.wifi.resources",
    "com.android.shell",
    "com.android.mms.service",
    "com.android.mtp",
    "com.android.nfc",
    "com.android.se",
    "com.android.ons",
    "com.android.companiondevicemanager",
    "com.android.intentresolver",
    "com.android.backupconfirm",
    "com.android.sharedstoragebackup",
    "com.android.storagemanager",
    "com.android.externalstorage",
    "com.android.cellbroadcastservice",
    "com.android.cellbroadcastreceiver",
    "com.google.android.gms",
    "com.google.android.gsf",
    "com.android.vending",
    "com.google.android.webview",
    "com.google.android.packageinstaller",
    "com.google.android.permissioncontroller",
    "com.google.android.ext.services",
    "com.google.android.ext.shared",
    "com.google.android.configupdater",
    "com.google.android.networkstack",
    "com.google.android.networkstack.tethering",
    "com.android.chrome",
];

/// Vendor packages the device needs to boot and stay online.
const VENDOR_CRITICAL: &[&str] = &[
    "com.samsung.android.providers.contacts",
    "com.samsung.android.providers.media",
    "com.samsung.android.providers.factory",
    "com.samsung.android.providers.trash",
    "com.samsung.android.provider.filterprovider",
    "com.samsung.android.incallui",
    "com.samsung.android.dialer",
    "com.samsung.android.messaging",
    "com.sec.android.app.launcher",
    "com.sec.android.emergencylauncher",
    "com.samsung.android.emergency",
    "com.samsung.android.app.telephonyui",
    "com.samsung.android.bootanimation",
    "com.samsung.android.server.wifi.mobilewips",
    "com.samsung.android.wifi.ai",
    "com.samsung.android.wifi.resources",
    "com.samsung.android.wifi.softap.resources",
    "com.samsung.android.settingsreceiver",
    "com.samsung.android.settingshelper",
    "com.samsung.android.connectivity",
    "com.samsung.android.networkstack",
    "com.samsung.android.mdecservice",
    "com.samsung.android.mobileservice",
    "com.samsung.android.authfw",
    "com.samsung.android.container",
    "com.samsung.android.location",
    "com.samsung.android.knox.containercore",
    "com.samsung.android.knox.attestation",
    "com.samsung.android.knox.sandbox",
    "com.sec.android.provider.badge",
];

const CRITICAL_PREFIXES: &[&str] = &[
    "android.auto_generated",
    "com.android.cts",
    "com.android.internal",
    "com.android.overlay",
    "com.samsung.internal",
    "com.samsung.android.overlay",
    "com.google.android.overlay",
    "com.sec.factory",
    "com.sec.android.Ril",
    "com.sec.imsservice",
    "com.samsung.ipservice",
    "com.samsung.klmsagent",
];

/// Substrings that mark a package critical in every mode.
const CRITICAL_FRAGMENTS: &[&str] = &[
    "com.android.systemui",
    "com.android.settings",
    "com.android.phone",
    "launcher",
];

const BLOATWARE: &[&str] = &[
    "com.facebook.katana",
    "com.facebook.system",
    "com.facebook.appmanager",
    "com.facebook.services",
    "com.instagram.android",
    "com.microsoft.skydrive",
    "com.microsoft.office.excel",
    "com.microsoft.office.word",
    "com.microsoft.office.powerpoint",
    "com.microsoft.office.outlook",
    "com.microsoft.office.officehubrow",
    "com.skype.raider",
    "com.google.android.youtube",
    "com.google.android.videos",
    "com.google.android.music",
    "com.google.android.apps.youtube.music",
    "com.google.android.apps.magazines",
    "com.google.android.apps.books",
    "com.google.android.apps.tachyon",
    "com.google.android.apps.podcasts",
    "com.google.android.apps.googleassistant",
    "com.google.android.googlequicksearchbox",
    "com.google.android.apps.bard",
    "com.samsung.android.game.gamehome",
    "com.samsung.android.game.gametools",
    "com.samsung.android.game.gos",
    "com.samsung.android.ardrawing",
    "com.samsung.android.aremoji",
    "com.samsung.android.aremojieditor",
    "com.samsung.android.bixby.agent",
    "com.samsung.android.bixby.service",
    "com.samsung.android.bixvision.framework",
    "com.samsung.android.svoiceime",
    "com.samsung.android.app.tips",
    "com.samsung.android.scloud",
    "com.samsung.android.spayfw",
    "com.samsung.android.kidsinstaller",
    "com.samsung.android.app.social",
    "com.samsung.android.tvplus",
    "com.samsung.android.themestore",
    "com.samsung.android.themecenter",
    "com.samsung.android.stickercenter",
    "com.samsung.android.app.dressroom",
    "com.samsung.android.forest",
    "com.verizon.mips.services",
    "com.verizon.services",
    "com.verizon.vzwavs",
    "com.vzw.hss.myverizon",
    "com.att.android.attsmartwifi",
    "com.att.myWireless",
    "com.att.tv",
    "com.att.csoiam.mobilekey",
    "com.att.deviceunlock",
    "com.att.dh",
    "com.att.iqi",
    "com.att.mobilesecurity",
    "com.att.personalcloud",
    "com.aura.jet.att",
    "com.aura.oobe.att",
    "com.tmobile.services.nameid",
    "com.tmobile.tmo",
    "com.twitter.android",
    "com.snapchat.android",
    "com.whatsapp",
    "com.linkedin.android",
    "com.pinterest",
    "com.king.candycrushsaga",
    "com.rovio.angrybirds",
    "com.supercell.clashofclans",
    "com.scopely.monopolygo",
    "com.tripledot.solitaire",
    "com.tripledot.woodoku",
    "com.block.juggle",
    "com.mobilityware.solitaire",
    "com.amazon.mShop.android.shopping",
    "com.amazon.kindle",
    "com.amazon.mp3",
    "com.ebay.mobile",
    "com.alibaba.aliexpresshd",
    "com.booking",
    "com.indeed.android.jobsearch",
    "flipboard.app",
    "com.cnn.mobile.android.phone",
    "com.foxnews.android",
    "com.rsupport.rs.activity.rsupport.aas2",
];

/// Lower-case substrings that flag a package as bloatware.
const BLOATWARE_PATTERNS: &[&str] = &[
    "com.facebook.",
    "com.instagram.",
    "com.whatsapp.",
    "com.twitter.",
    "com.snapchat.",
    "com.tiktok.",
    "com.microsoft.",
    "com.linkedin.",
    "com.netflix.",
    "com.spotify.",
    "com.amazon.",
    ".games.",
    ".game.",
    "candy",
    "crush",
];

/// Table-backed policy. The farm keep list wins over every bloatware rule.
#[derive(Debug, Clone)]
pub struct StaticPackagePolicy {
    allowed: HashSet<String>,
    critical: HashSet<String>,
    keep: HashSet<String>,
}

impl StaticPackagePolicy {
    pub fn new<I, S>(keep_packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let critical: HashSet<String> = SYSTEM_CRITICAL
            .iter()
            .chain(VENDOR_CRITICAL)
            .map(|package| package.to_string())
            .collect();
        let keep: HashSet<String> = keep_packages.into_iter().map(Into::into).collect();
        let allowed = critical.iter().chain(keep.iter()).cloned().collect();
        Self {
            allowed,
            critical,
            keep,
        }
    }

    pub fn is_kept(&self, package: &str) -> bool {
        self.keep.contains(package)
    }
}

impl PackagePolicy for StaticPackagePolicy {
    fn is_allowed(&self, package: &str) -> bool {
        self.allowed.contains(package)
            || CRITICAL_PREFIXES
                .iter()
                .any(|prefix| package.starts_with(prefix))
    }

    fn is_bloatware(&self, package: &str) -> bool {
        if self.is_kept(package) || self.is_critical(package) {
            return false;
        }
        if BLOATWARE.contains(&package) {
            return true;
        }
        let lower = package.to_lowercase();
        BLOATWARE_PATTERNS
            .iter()
            .any(|pattern| lower.contains(pattern))
    }

    fn is_critical(&self, package: &str) -> bool {
        self.critical.contains(package)
            || CRITICAL_PREFIXES
                .iter()
                .any(|prefix| package.starts_with(prefix))
            || CRITICAL_FRAGMENTS
                .iter()
                .any(|fragment| package.contains(fragment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StaticPackagePolicy {
        StaticPackagePolicy::new(["com.zhiliaoapp.musically", "com.scheler.superproxy"])
    }

    #[test]
    fn bloatware_by_table_and_pattern() {
        let policy = policy();
        assert!(policy.is_bloatware("com.facebook.katana"));
        assert!(policy.is_bloatware("com.netflix.mediaclient"));
        assert!(policy.is_bloatware("com.example.candyland"));
        assert!(!policy.is_bloatware("com.android.vending"));
    }

    #[test]
    fn keep_list_overrides_bloatware() {
        let policy = policy();
        assert!(!policy.is_bloatware("com.zhiliaoapp.musically"));
        assert!(policy.is_allowed("com.zhiliaoapp.musically"));
    }

    #[test]
    fn critical_packages_and_prefixes() {
        let policy = policy();
        assert!(policy.is_critical("com.android.systemui"));
        assert!(policy.is_critical("com.sec.android.app.launcher"));
        assert!(policy.is_critical("com.android.overlay.common"));
        assert!(policy.is_critical("com.vendor.launcher3"));
        assert!(!policy.is_critical("com.whatsapp"));
        assert!(policy.is_allowed("com.google.android.overlay.gmsconfig"));
        assert!(!policy.is_allowed("com.whatsapp"));
    }
}
