use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

/// Return the current UTC time as an RFC 3339 string (second precision),
/// the format used for timestamp annotations.
pub fn utc_now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── Label / annotation vocabulary ─────────────────────────────────────────────

pub const MANAGED_BY_LABEL: &str = "ssvirt.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "ssvirt";
pub const KIND_LABEL: &str = "ssvirt.io/kind";
pub const KIND_VDC: &str = "vdc";
pub const KIND_ORGANIZATION: &str = "organization";
pub const VDC_ID_LABEL: &str = "ssvirt.io/vdc-id";
pub const ORGANIZATION_ID_LABEL: &str = "ssvirt.io/organization-id";

/// Row identity of the vApp a VM belongs to (fast lookup path).
pub const VAPP_ID_LABEL: &str = "ssvirt.io/vapp-id";
/// Name of the vApp a VM belongs to (used to discover unknown VMs).
pub const VAPP_NAME_LABEL: &str = "ssvirt.io/vapp-name";
/// UID of the TemplateInstance that created an object.
pub const TEMPLATE_INSTANCE_OWNER_LABEL: &str = "template.openshift.io/template-instance-owner";

pub const DISABLED_ANNOTATION: &str = "ssvirt.io/disabled";
pub const ORPHANED_AT_ANNOTATION: &str = "ssvirt.io/orphaned-at";
/// Set on a VDC namespace until its default-deny NetworkPolicy exists.
pub const ISOLATION_PENDING_ANNOTATION: &str = "ssvirt.io/isolation-pending";
pub const VDC_NAME_ANNOTATION: &str = "ssvirt.io/vdc-name";
pub const ORGANIZATION_NAME_ANNOTATION: &str = "ssvirt.io/organization-name";
pub const DISPLAY_NAME_ANNOTATION: &str = "ssvirt.io/display-name";
/// Guest OS declared on a VM by its template.
pub const GUEST_OS_ANNOTATION: &str = "vm.kubevirt.io/os";

/// Label selector matching every namespace created by this system.
pub fn managed_namespace_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}

// ── Controller settings (injected via CLI flags / env) ────────────────────────

/// Intervals and limits shared by every controller.
/// Defaults are the fixed constants the reconcilers were tuned with.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub vdc_poll_interval: Duration,
    pub organization_poll_interval: Duration,
    pub vm_resync_interval: Duration,
    pub vapp_resync_interval: Duration,
    /// An unchanged VM status is not rewritten if the row was touched
    /// more recently than this.
    pub status_staleness_window: Duration,
    pub error_requeue_delay: Duration,
    pub concurrency: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            vdc_poll_interval: Duration::from_secs(120),
            organization_poll_interval: Duration::from_secs(120),
            vm_resync_interval: Duration::from_secs(300),
            vapp_resync_interval: Duration::from_secs(300),
            status_staleness_window: Duration::from_secs(600),
            error_requeue_delay: Duration::from_secs(60),
            concurrency: 8,
        }
    }
}

impl ControllerSettings {
    /// Concurrency for the kube-runtime controllers, where 0 means
    /// unlimited; oversized values saturate instead of wrapping.
    pub fn kube_concurrency(&self) -> u16 {
        u16::try_from(self.concurrency.max(1)).unwrap_or(u16::MAX)
    }
}

// ── Quantities ────────────────────────────────────────────────────────────────

const MIB: i128 = 1024 * 1024;

/// Parse a Kubernetes quantity string into milli-units.
///
/// Supports plain numbers, decimal fractions, binary suffixes
/// (`Ki`..`Ei`), decimal suffixes (`n`, `u`, `m`, `k`, `M`..`E`) and
/// exponent notation (`1e3`). Returns `None` for anything unparsable.
/// Sub-milli values are truncated toward zero.
pub fn parse_quantity(raw: &str) -> Option<i128> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return None;
    }

    // Scale expressed as (multiplier, power of ten) applied to the number.
    let (multiplier, exp10): (i128, i32) = match suffix {
        "" => (1, 0),
        "Ki" => (1 << 10, 0),
        "Mi" => (1 << 20, 0),
        "Gi" => (1 << 30, 0),
        "Ti" => (1 << 40, 0),
        "Pi" => (1 << 50, 0),
        "Ei" => (1 << 60, 0),
        "n" => (1, -9),
        "u" => (1, -6),
        "m" => (1, -3),
        "k" => (1, 3),
        "M" => (1, 6),
        "G" => (1, 9),
        "T" => (1, 12),
        "P" => (1, 15),
        "E" => (1, 18),
        other => {
            let exp = other.strip_prefix(['e', 'E'])?;
            (1, exp.parse::<i32>().ok()?)
        }
    };

    let negative = number.starts_with('-');
    let digits = number.trim_start_matches(['+', '-']);
    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    // mantissa * 10^(exp10 + 3 - frac_len) * multiplier, in milli-units.
    let mantissa: i128 = format!("{whole}{frac}").parse().ok()?;
    let scale = exp10 + 3 - frac.len() as i32;
    let scaled = if scale >= 0 {
        mantissa
            .checked_mul(10i128.checked_pow(scale as u32)?)?
            .checked_mul(multiplier)?
    } else {
        mantissa.checked_mul(multiplier)? / 10i128.checked_pow((-scale) as u32)?
    };
    Some(if negative { -scaled } else { scaled })
}

/// Parse a byte quantity and convert it to whole MiB (floor division).
pub fn quantity_to_mb(raw: &str) -> Option<i64> {
    let milli = parse_quantity(raw)?;
    if milli < 0 {
        return None;
    }
    i64::try_from(milli / 1000 / MIB).ok()
}

/// Compare two quantity maps by value rather than by spelling.
/// Keys present in only one map make them unequal.
pub fn quantity_maps_equal(a: &BTreeMap<String, String>, b: &BTreeMap<String, String>) -> bool {
    a.len() == b.len()
        && a.iter().all(|(k, va)| match b.get(k) {
            Some(vb) => match (parse_quantity(va), parse_quantity(vb)) {
                (Some(x), Some(y)) => x == y,
                _ => va == vb,
            },
            None => false,
        })
}
