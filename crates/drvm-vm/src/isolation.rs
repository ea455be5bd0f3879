//! Guest slimming: generates the PowerShell scripts that strip the Windows
//! guest down to the services driver management needs. Nothing here runs
//! inside the guest; the scripts are copied in once per image.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::{Result, VmError};

const ESSENTIAL_PROCESSES: &[&str] = &[
    "System",
    "smss.exe",
    "csrss.exe",
    "wininit.exe",
    "services.exe",
    "lsass.exe",
    "DriverStore",
    "PnPUtil.exe",
    "devcon.exe",
    "setupapi.dll",
    "svchost.exe",
    "dllhost.exe",
    "RuntimeBroker.exe",
];

const ESSENTIAL_SERVICES: &[&str] = &[
    "PlugPlay",
    "DeviceInstall",
    "DeviceSetupManager",
    "DcomLaunch",
    "RpcSs",
    "RpcEptMapper",
    "SENS",
    "EventLog",
    "WinMgmt",
    "CryptSvc",
];

const DISABLED_SERVICES: &[&str] = &[
    // updates
    "wuauserv",
    "UsoSvc",
    "WaaSMedicSvc",
    // telemetry
    "DiagTrack",
    "dmwappushservice",
    "WSearch",
    // defender
    "WinDefend",
    "SecurityHealthService",
    "WdNisSvc",
    // store and xbox
    "InstallService",
    "LicenseManager",
    "XblAuthManager",
    "XblGameSave",
    "XboxGipSvc",
    "XboxNetApiSvc",
    "OneSyncSvc",
    "SysMain",
    "Spooler",
    "Themes",
    "W32Time",
    "TermService",
    "SessionEnv",
    "bthserv",
    "WMPNetworkSvc",
    "HomeGroupListener",
    "HomeGroupProvider",
    "lfsvc",
];

const FEATURES_TO_DISABLE: &[&str] = &[
    "MediaPlayback",
    "WindowsMediaPlayer",
    "Internet-Explorer-Optional-amd64",
    "Printing-XPSServices-Features",
    "WorkFolders-Client",
];

const TASKS_TO_DISABLE: &[&str] = &[
    r"\Microsoft\Windows\Application Experience\",
    r"\Microsoft\Windows\Customer Experience Improvement Program\",
    r"\Microsoft\Windows\Windows Error Reporting\",
    r"\Microsoft\Windows\Maintenance\",
];

pub const SERVICES_SCRIPT: &str = "isolate_services.ps1";
pub const MONITOR_SCRIPT: &str = "monitor_processes.ps1";
pub const STARTUP_SCRIPT: &str = "configure_startup.ps1";
pub const SUMMARY_FILE: &str = "isolation_summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IsolationSummary {
    pub essential_processes: usize,
    pub essential_services: usize,
    pub disabled_services: usize,
    pub estimated_ram_savings_mb: u32,
    pub estimated_cpu_savings_percent: u32,
    pub boot_time_reduction_percent: u32,
    pub isolated_to_driver_functions: bool,
}

/// Allow/deny lists for the guest. The essential and disabled sets never
/// overlap; [`ProcessIsolator::new`] rejects lists that do.
#[derive(Debug, Clone)]
pub struct ProcessIsolator {
    essential_processes: BTreeSet<String>,
    essential_services: BTreeSet<String>,
    disabled_services: BTreeSet<String>,
}

impl Default for ProcessIsolator {
    fn default() -> Self {
        let set = |names: &[&str]| -> BTreeSet<String> { names.iter().map(|n| n.to_string()).collect() };
        ProcessIsolator {
            essential_processes: set(ESSENTIAL_PROCESSES),
            essential_services: set(ESSENTIAL_SERVICES),
            disabled_services: set(DISABLED_SERVICES),
        }
    }
}

impl ProcessIsolator {
    pub fn new<I, S>(essential_processes: I, essential_services: I, disabled_services: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let isolator = ProcessIsolator {
            essential_processes: essential_processes.into_iter().map(Into::into).collect(),
            essential_services: essential_services.into_iter().map(Into::into).collect(),
            disabled_services: disabled_services.into_iter().map(Into::into).collect(),
        };
        isolator.check_disjoint()?;
        Ok(isolator)
    }

    /// Windows names are case-insensitive, so the comparison is too.
    fn check_disjoint(&self) -> Result<()> {
        let disabled: BTreeSet<String> = self
            .disabled_services
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        let clash = self
            .essential_processes
            .iter()
            .chain(&self.essential_services)
            .find(|name| disabled.contains(&name.to_lowercase()));
        match clash {
            Some(name) => Err(VmError::InvalidConfig(format!(
                "{name} is listed as both essential and disabled"
            ))),
            None => Ok(()),
        }
    }

    pub fn essential_processes(&self) -> &BTreeSet<String> {
        &self.essential_processes
    }

    pub fn essential_services(&self) -> &BTreeSet<String> {
        &self.essential_services
    }

    pub fn disabled_services(&self) -> &BTreeSet<String> {
        &self.disabled_services
    }

    /// Stops and disables the bloat services, then makes sure the essential
    /// ones start automatically.
    pub fn service_script(&self) -> String {
        let mut s = String::new();
        s.push_str("# Driver VM service isolation. Run as Administrator inside the guest.\n\n");
        s.push_str("Write-Host \"Isolating guest services for driver operations...\" -ForegroundColor Cyan\n\n");

        push_array(&mut s, "servicesToDisable", &self.disabled_services);
        s.push_str(
            r#"foreach ($service in $servicesToDisable) {
    $svc = Get-Service -Name $service -ErrorAction SilentlyContinue
    if ($svc) {
        Write-Host "Disabling: $service" -ForegroundColor Gray
        Stop-Service -Name $service -Force -ErrorAction SilentlyContinue
        Set-Service -Name $service -StartupType Disabled -ErrorAction SilentlyContinue
    }
}

"#,
        );

        push_array(&mut s, "essentialServices", &self.essential_services);
        s.push_str(
            r#"foreach ($service in $essentialServices) {
    $svc = Get-Service -Name $service -ErrorAction SilentlyContinue
    if ($svc) {
        Write-Host "Keeping: $service" -ForegroundColor Green
        Set-Service -Name $service -StartupType Automatic -ErrorAction SilentlyContinue
        Start-Service -Name $service -ErrorAction SilentlyContinue
    } else {
        Write-Host "Warning: essential service $service not present" -ForegroundColor Yellow
    }
}

Write-Host "Disabled services: $($servicesToDisable.Count)"
Write-Host "Essential services: $($essentialServices.Count)"
Write-Host "Service isolation complete." -ForegroundColor Green
"#,
        );
        s
    }

    /// Terminates every process that is not on the essential list.
    pub fn process_monitor_script(&self) -> String {
        let mut s = String::new();
        s.push_str("# Driver VM process monitor. Terminates non-essential processes.\n\n");
        push_array(&mut s, "essentialProcesses", &self.essential_processes);
        s.push_str(
            r#"foreach ($proc in Get-Process) {
    $exe = $proc.ProcessName + ".exe"
    if ($essentialProcesses -contains $exe -or $essentialProcesses -contains $proc.ProcessName) {
        continue
    }
    Write-Host "Terminating: $exe" -ForegroundColor Gray
    Stop-Process -Id $proc.Id -Force -ErrorAction SilentlyContinue
}

Write-Host "Process cleanup complete." -ForegroundColor Green
"#,
        );
        s
    }

    /// Turns off optional features, visual effects and telemetry tasks.
    pub fn startup_script(&self) -> String {
        let mut s = String::new();
        s.push_str("# Driver VM startup configuration. Minimises boot-time work.\n\n");

        let features: BTreeSet<String> = FEATURES_TO_DISABLE.iter().map(|f| f.to_string()).collect();
        push_array(&mut s, "featuresToDisable", &features);
        s.push_str(
            r#"foreach ($feature in $featuresToDisable) {
    Write-Host "Disabling feature: $feature" -ForegroundColor Gray
    Disable-WindowsOptionalFeature -FeatureName $feature -Online -NoRestart -ErrorAction SilentlyContinue
}

$regPath = "HKCU:\Software\Microsoft\Windows\CurrentVersion\Explorer\VisualEffects"
Set-ItemProperty -Path $regPath -Name "VisualFXSetting" -Value 2 -ErrorAction SilentlyContinue

"#,
        );

        let tasks: BTreeSet<String> = TASKS_TO_DISABLE.iter().map(|t| t.to_string()).collect();
        push_array(&mut s, "taskPaths", &tasks);
        s.push_str(
            r#"foreach ($path in $taskPaths) {
    Get-ScheduledTask -TaskPath $path -ErrorAction SilentlyContinue | Disable-ScheduledTask -ErrorAction SilentlyContinue
}

Write-Host "Startup configuration complete." -ForegroundColor Green
"#,
        );
        s
    }

    pub fn summary(&self) -> IsolationSummary {
        IsolationSummary {
            essential_processes: self.essential_processes.len(),
            essential_services: self.essential_services.len(),
            disabled_services: self.disabled_services.len(),
            estimated_ram_savings_mb: 250,
            estimated_cpu_savings_percent: 60,
            boot_time_reduction_percent: 40,
            isolated_to_driver_functions: true,
        }
    }

    /// Write all scripts and the summary into `dir`, creating it if needed.
    pub fn export(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let summary = serde_json::to_string_pretty(&self.summary())?;
        let files = [
            (SERVICES_SCRIPT, self.service_script()),
            (MONITOR_SCRIPT, self.process_monitor_script()),
            (STARTUP_SCRIPT, self.startup_script()),
            (SUMMARY_FILE, summary),
        ];

        let mut written = Vec::with_capacity(files.len());
        for (name, contents) in files {
            let path = dir.join(name);
            fs::write(&path, contents)?;
            written.push(path);
        }
        info!(dir = %dir.display(), files = written.len(), "exported isolation scripts");
        Ok(written)
    }
}

fn push_array(s: &mut String, var: &str, items: &BTreeSet<String>) {
    let _ = writeln!(s, "${var} = @(");
    let last = items.len().saturating_sub(1);
    for (i, item) in items.iter().enumerate() {
        let sep = if i == last { "" } else { "," };
        let _ = writeln!(s, "    \"{}\"{sep}", item.replace('"', "`\""));
    }
    s.push_str(")\n\n");
}
