use crate::core::io::{
    Parsed, ParseError, barostat_name, simulation_kind_name, thermostat_name,
};
use crate::core::models::role::StageRole;
use crate::core::utils::values::{FortranValue, clean_value};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

/// One `&wt` varying-conditions entry (temperature ramps, restraint-weight
/// schedules, cutoff schedules).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WtSchedule {
    pub quantity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_end: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub increment: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<i64>,
}

/// Positional-restraint settings from `&cntrl` (atom mask + force constant).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestraintSpec {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_constant: Option<f64>,
}

/// A namelist other than `&cntrl`/`&wt`, kept verbatim for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamelistBlock {
    pub name: String,
    pub entries: BTreeMap<String, FortranValue>,
}

/// Metadata extracted from an AMBER control input (mdin) file.
///
/// AMBER-manual defaults (dt, temp0, cutoff, ntb resolution) are applied
/// once a `&cntrl` namelist is present, because they are documented engine
/// semantics; genuinely missing data such as an unset `nstlim` stays absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControlRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestep_ps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_flag: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thermostat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barostat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodic_boundary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implicit_solvent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy_interval_steps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinate_interval_steps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_interval_steps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trajectory_format: Option<String>,
    pub restraints: RestraintSpec,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wt_schedules: Vec<WtSchedule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub namelist: BTreeMap<String, FortranValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_namelists: Vec<NamelistBlock>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub restraint_definitions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_hint: Option<StageRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_description: Option<String>,
}

impl ControlRecord {
    fn cntrl_i64(&self, key: &str) -> Option<i64> {
        self.namelist.get(key).and_then(FortranValue::as_i64)
    }

    fn cntrl_f64(&self, key: &str) -> Option<f64> {
        self.namelist.get(key).and_then(FortranValue::as_f64)
    }
}

static NAMELIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?si)&([a-z0-9_]+)(.*?)(?:/|&end)").unwrap());

static KEY_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<key>[A-Za-z0-9_]+)\s*=\s*(?P<value>'[^']*'|"[^"]*"|\$\{[^}]+\}|\$\([^)]+\)|[^,/\s]+)"#,
    )
    .unwrap()
});

static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[!#][^\n]*").unwrap());

fn parse_namelist_body(body: &str, warnings: &mut Vec<String>) -> BTreeMap<String, FortranValue> {
    let mut entries = BTreeMap::new();
    for caps in KEY_VALUE_RE.captures_iter(body) {
        let key = caps["key"].to_ascii_lowercase();
        match clean_value(&caps["value"]) {
            Some(value) => {
                entries.insert(key, value);
            }
            None => warnings.push(format!(
                "non-finite value for '{key}' treated as absent"
            )),
        }
    }
    entries
}

fn wt_schedule_from(entries: &BTreeMap<String, FortranValue>) -> Option<WtSchedule> {
    let quantity = entries
        .get("type")
        .and_then(FortranValue::as_str)
        .map(|s| s.trim().to_ascii_uppercase())?;
    if quantity.is_empty() || quantity == "END" {
        return None;
    }
    Some(WtSchedule {
        quantity,
        step_start: entries.get("istep1").and_then(FortranValue::as_i64),
        step_end: entries.get("istep2").and_then(FortranValue::as_i64),
        value_start: entries.get("value1").and_then(FortranValue::as_f64),
        value_end: entries.get("value2").and_then(FortranValue::as_f64),
        increment: entries.get("iinc").and_then(FortranValue::as_i64),
        multiplier: entries.get("imult").and_then(FortranValue::as_i64),
    })
}

fn classify_ensemble(
    ntb: Option<i64>,
    ntt: Option<i64>,
    ntp: Option<i64>,
    implicit: bool,
) -> String {
    let has_thermostat = ntt.is_some_and(|t| t != 0);
    if implicit {
        return if has_thermostat {
            "Implicit-solvent NVT".to_string()
        } else {
            "Implicit-solvent NVE".to_string()
        };
    }
    let Some(ntb) = ntb else {
        return "Unknown ensemble (template)".to_string();
    };
    match ntb {
        0 => {
            if has_thermostat {
                "NVT (no PBC)".to_string()
            } else {
                "NVE (no PBC)".to_string()
            }
        }
        1 => {
            if has_thermostat {
                "NVT (PBC, constant volume)".to_string()
            } else {
                "NVE (PBC, constant volume)".to_string()
            }
        }
        _ => {
            let base = if has_thermostat { "NPT" } else { "NPH" };
            match ntp {
                Some(1) => format!("{base} (isotropic)"),
                Some(2) => format!("{base} (anisotropic)"),
                Some(3) => format!("{base} (semi-isotropic)"),
                Some(other) => format!("{base} (ntp={other})"),
                None => format!("{base} (unknown barostat)"),
            }
        }
    }
}

fn infer_role(record: &ControlRecord) -> Option<StageRole> {
    let imin = record.cntrl_i64("imin").unwrap_or(0);
    let title = record.title.as_deref().unwrap_or("").to_ascii_lowercase();

    if imin != 0 || title.contains("minim") {
        return Some(StageRole::Minimization);
    }
    if title.contains("heat") || title.contains("thermal") || title.contains("warm") {
        return Some(StageRole::Heating);
    }
    if title.contains("equil") || title.contains("nvt") || title.contains("npt") {
        return Some(StageRole::Equilibration);
    }
    if title.contains("prod") {
        return Some(StageRole::Production);
    }

    let tempi = record.cntrl_f64("tempi");
    let temp0 = record.cntrl_f64("temp0").unwrap_or(300.0);
    if let Some(tempi) = tempi {
        if tempi < temp0 && tempi < 50.0 {
            return Some(StageRole::Heating);
        }
    }
    let ntr = record.cntrl_i64("ntr").unwrap_or(0);
    let ibelly = record.cntrl_i64("ibelly").unwrap_or(0);
    if ntr == 1 || ibelly == 1 {
        return Some(StageRole::Equilibration);
    }
    if record.cntrl_i64("nstlim").unwrap_or(0) > 500_000 {
        return Some(StageRole::Production);
    }
    None
}

fn describe_role(record: &ControlRecord) -> String {
    let ensemble = record.ensemble.as_deref().unwrap_or("Unknown ensemble");
    let restrained = record.restraints.active;
    let total_ns = match (record.step_count, record.timestep_ps) {
        (Some(steps), Some(dt)) if dt > 0.0 => Some(steps as f64 * dt / 1000.0),
        _ => None,
    };

    match record.role_hint {
        Some(StageRole::Minimization) => "Energy minimization".to_string(),
        Some(StageRole::Heating) => "Heating / thermalization".to_string(),
        Some(StageRole::Equilibration) if restrained => {
            format!("Equilibration with positional restraints [{ensemble}]")
        }
        Some(StageRole::Equilibration) => format!("Equilibration [{ensemble}]"),
        Some(StageRole::Production) if restrained => {
            format!("Production with restraints [{ensemble}]")
        }
        Some(StageRole::Production) => format!("Production [{ensemble}]"),
        _ => match total_ns {
            Some(ns) if ns < 0.1 => format!("Short MD segment ({ns:.3} ns)"),
            Some(ns) if ns <= 5.0 => format!("Short production or equilibration ({ns:.3} ns)"),
            Some(ns) => format!("Production run ({ns:.3} ns)"),
            None => format!("Generic MD stage [{ensemble}]"),
        },
    }
}

fn interpret(record: &mut ControlRecord, warnings: &mut Vec<String>) {
    let imin = record.cntrl_i64("imin").unwrap_or(0);
    record.simulation_kind = Some(simulation_kind_name(imin));

    record.step_count = record
        .cntrl_i64("nstlim")
        .and_then(|n| u64::try_from(n).ok());
    record.timestep_ps = Some(record.cntrl_f64("dt").unwrap_or(0.001));
    record.restart_flag = Some(record.cntrl_i64("irest").unwrap_or(0));

    record.energy_interval_steps = Some(
        record
            .cntrl_i64("ntpr")
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(50),
    );
    record.coordinate_interval_steps = Some(
        record
            .cntrl_i64("ntwx")
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0),
    );
    record.restart_interval_steps = record
        .cntrl_i64("ntwr")
        .or_else(|| record.cntrl_i64("nstlim"))
        .and_then(|n| u64::try_from(n).ok());
    record.trajectory_format = Some(
        if record.cntrl_i64("ioutfm").unwrap_or(1) == 1 {
            "NetCDF".to_string()
        } else {
            "ASCII".to_string()
        },
    );

    let ntt = record.cntrl_i64("ntt");
    record.thermostat = Some(thermostat_name(ntt.unwrap_or(0)));
    record.target_temperature = Some(record.cntrl_f64("temp0").unwrap_or(300.0));

    let ntp = record.cntrl_i64("ntp");
    let igb = record.cntrl_i64("igb").unwrap_or(0);

    // ntb default per the manual: 0 when igb > 0, 2 when ntp > 0, else 1.
    let ntb = record.cntrl_i64("ntb").or(Some(if igb > 0 {
        0
    } else if ntp.unwrap_or(0) > 0 {
        2
    } else {
        1
    }));

    record.periodic_boundary = Some(match ntb {
        Some(0) => "Vacuum / No PBC".to_string(),
        Some(1) => "PBC / Constant Volume".to_string(),
        Some(n) if n >= 2 => "PBC / Constant Pressure".to_string(),
        Some(n) => format!("Unknown (ntb={n})"),
        None => "Unknown".to_string(),
    });

    record.barostat = Some(barostat_name(
        ntp.unwrap_or(0),
        record.cntrl_i64("barostat").unwrap_or(1),
    ));

    record.constraints = Some(match record.cntrl_i64("ntc").unwrap_or(1) {
        1 => "None".to_string(),
        2 => "H-bonds".to_string(),
        3 => "All bonds".to_string(),
        other => format!("ntc={other}"),
    });

    record.cutoff = Some(
        record
            .cntrl_f64("cut")
            .unwrap_or(if igb > 0 { 9999.0 } else { 8.0 }),
    );

    if igb != 0 {
        record.implicit_solvent = Some(format!("GB Model {igb}"));
        record.periodic_boundary = Some("Implicit solvent (no periodic box)".to_string());
    }

    let ntr = record.cntrl_i64("ntr").unwrap_or(0);
    record.restraints.active = ntr != 0;
    record.restraints.force_constant = record.cntrl_f64("restraint_wt");
    record.restraints.mask = record
        .namelist
        .get("restraintmask")
        .and_then(FortranValue::as_str)
        .map(str::to_string)
        .or_else(|| {
            record
                .namelist
                .iter()
                .find(|(k, _)| k.contains("restraintmask") || k.starts_with("restraint_mask"))
                .and_then(|(_, v)| v.as_str())
                .map(str::to_string)
        });

    let mut features = Vec::new();
    if record.cntrl_i64("nmropt").unwrap_or(0) != 0 {
        features.push("NMR / &wt options".to_string());
    }
    if record.cntrl_i64("ifqnt").unwrap_or(0) != 0 {
        features.push("QM/MM".to_string());
    }
    if record.cntrl_i64("icfe").unwrap_or(0) == 1
        || record.cntrl_i64("infe").unwrap_or(0) == 1
        || record.cntrl_i64("ifmbar").unwrap_or(0) == 1
    {
        features.push("Free energy / TI / MBAR".to_string());
    }
    if record.cntrl_i64("icnstph").unwrap_or(0) == 1 || record.cntrl_i64("iphmd").unwrap_or(0) == 1
    {
        features.push("Constant pH MD".to_string());
    }
    if record.cntrl_i64("igamd").unwrap_or(0) != 0 {
        features.push("Gaussian Accelerated MD (GaMD)".to_string());
    }
    if record.cntrl_i64("numexchg").unwrap_or(0) != 0 {
        features.push("Replica Exchange MD (REMD)".to_string());
    }
    for entry in &record.wt_schedules {
        match entry.quantity.as_str() {
            "TEMP0" => features.push("TEMP0 schedule in &wt".to_string()),
            "REST" | "RESTS" | "RESTL" | "NOESY" | "SHIFTS" => {
                features.push("Restraint-weight schedule in &wt".to_string());
            }
            "CUT" => features.push("Cutoff schedule in &wt".to_string()),
            _ => {}
        }
    }
    features.dedup();
    record.features = features;

    record.ensemble = Some(classify_ensemble(
        ntb,
        ntt,
        ntp,
        record.implicit_solvent.is_some(),
    ));

    record.role_hint = infer_role(record);
    record.role_description = Some(describe_role(record));

    // Sanity checks.
    let ntx = record.cntrl_i64("ntx");
    if record.cntrl_i64("irest") == Some(1) {
        if let Some(ntx) = ntx {
            if !matches!(ntx, 4 | 5 | 7) {
                warnings.push(format!(
                    "irest=1 but ntx={ntx} (typical restart uses ntx=4, 5, or 7)"
                ));
            }
        }
    }
    if let Some(dt) = record.timestep_ps {
        if dt > 0.004 {
            warnings.push(format!(
                "unusually large timestep dt={dt} ps (check hydrogen mass repartitioning / constraints)"
            ));
        }
    }
    if let Some(title) = &record.title {
        if title.to_ascii_lowercase().contains("restraint") && !record.restraints.active {
            warnings.push("title mentions restraints but ntr=0 in &cntrl".to_string());
        }
    }
}

/// Parses an AMBER control input (mdin) file into a [`ControlRecord`].
///
/// # Errors
///
/// Returns [`ParseError::Io`] when the file cannot be read and
/// [`ParseError::UnrecognizedFormat`] when it contains no Fortran namelist.
pub fn parse(path: &Path) -> Result<Parsed<ControlRecord>, ParseError> {
    let content = fs::read_to_string(path).map_err(|e| ParseError::io(path, e))?;

    let mut record = ControlRecord::default();
    let mut warnings = Vec::new();

    for line in content.lines() {
        let clean = line.trim();
        if clean.is_empty() || clean.starts_with('#') || clean.starts_with('!') {
            continue;
        }
        if !clean.starts_with('&') {
            record.title = Some(clean.to_string());
        }
        break;
    }

    let stripped = COMMENT_RE.replace_all(&content, "").into_owned();

    let mut last_end = 0usize;
    let mut matched_any = false;
    for caps in NAMELIST_RE.captures_iter(&stripped) {
        matched_any = true;
        let name = caps[1].to_ascii_lowercase();
        let entries = parse_namelist_body(&caps[2], &mut warnings);
        if name == "cntrl" {
            record.namelist.extend(entries);
        } else if name == "wt" {
            if let Some(schedule) = wt_schedule_from(&entries) {
                record.wt_schedules.push(schedule);
            }
        } else {
            record.extra_namelists.push(NamelistBlock { name, entries });
        }
        if let Some(m) = caps.get(0) {
            last_end = m.end();
        }
    }

    if !matched_any {
        return Err(ParseError::UnrecognizedFormat {
            path: path.to_path_buf(),
            expected: "an AMBER control input (Fortran namelists)",
        });
    }

    record.restraint_definitions = stripped[last_end..]
        .lines()
        .map(str::trim)
        .filter(|l| {
            !l.is_empty()
                && !l.starts_with('&')
                && !l.eq_ignore_ascii_case("end")
                && !l.eq_ignore_ascii_case("eof")
        })
        .map(str::to_string)
        .collect();

    interpret(&mut record, &mut warnings);

    Ok(Parsed {
        path: path.to_path_buf(),
        warnings,
        record,
    })
}
