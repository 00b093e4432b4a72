use crate::core::io::{Parsed, ParseError};
use crate::core::utils::geometry;
use phf::{Set, phf_set};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

// Residue-name heuristics follow the AMBER reference manual (water models,
// atomic ions, standard force-field residue sets).

static WATER_RESNAMES: Set<&'static str> = phf_set! {
    "WAT", "HOH", "SOL",
    "TIP3", "TP3", "TIP3P",
    "TIP4", "T4P", "TIP4P", "T4E",
    "TIP5", "T5P", "TIP5P",
    "SPC", "SPCE", "SPC/E",
    "OPC", "OPC3", "OL3",
    "POL3", "QSP", "F3C",
};

static ION_RESNAMES: Set<&'static str> = phf_set! {
    "Li+", "Na+", "K+", "Rb+", "Cs+",
    "F-", "Cl-", "Br-", "I-",
    "Mg+", "Mg2+", "Ca2+", "Zn2+",
    "Ba2+", "Sr2+", "Fe2+", "Mn2+",
    "Co2+", "Ni2+", "Cu2+", "Cd2+",
    "Fe3+", "Cr3+", "Al3+",
};

static PROTEIN_RESNAMES: Set<&'static str> = phf_set! {
    "ALA", "ARG", "ASN", "ASP", "CYS", "GLN", "GLU", "GLY", "HIS", "ILE",
    "LEU", "LYS", "MET", "PHE", "PRO", "SER", "THR", "TRP", "TYR", "VAL",
    "HIE", "HID", "HIP", "CYX", "CYM", "ASH", "GLH", "LYN", "ARN",
    "ACE", "NME", "NHE", "NH2", "CH3",
    "CRO", "CR2", "CRF", "CRQ", "CH6",
};

static DNA_RESNAMES: Set<&'static str> = phf_set! {
    "DA", "DC", "DG", "DT",
    "DA5", "DC5", "DG5", "DT5",
    "DA3", "DC3", "DG3", "DT3",
};

static RNA_RESNAMES: Set<&'static str> = phf_set! {
    "A", "C", "G", "U",
    "A5", "C5", "G5", "U5",
    "A3", "C3", "G3", "U3",
    "RA", "RC", "RG", "RU",
};

static LIPID_RESNAMES: Set<&'static str> = phf_set! {
    "LAL", "MY", "PA", "SA", "OL", "ST", "AR", "DHA",
    "PC", "PE", "PS", "PGR", "PGS", "PH", "SPM",
    "CHL", "CHOL", "POPC", "POPE", "DOPC", "DPPC",
};

static ORGANIC_SOLVENT_RESNAMES: Set<&'static str> = phf_set! {
    "MEOH", "CHCL3", "NMA", "UREA", "ETH", "MOL",
};

/// Raw prmtop charges are in internal units; dividing by this constant
/// yields elementary charges.
const CHARGE_UNIT: f64 = 18.2223;

const NEUTRALITY_THRESHOLD: f64 = 1e-2;

/// Only these `%FLAG` sections are retained; everything else is skipped
/// without buffering so multi-million-atom topologies stay cheap to scan.
const TARGET_FLAGS: &[&str] = &[
    "TITLE",
    "CTITLE",
    "POINTERS",
    "CHARGE",
    "MASS",
    "ATOMIC_NUMBER",
    "RESIDUE_LABEL",
    "BOX_DIMENSIONS",
    "RADIUS_SET",
    "SOLVENT_POINTERS",
    "FORCE_FIELD_TYPE",
    "CMAP_COUNT",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SolventEnvironment {
    #[default]
    Vacuum,
    Explicit,
    Implicit,
}

/// Metadata extracted from an AMBER topology (prmtop/parm7) file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopologyRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_field_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub force_field_features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atom_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residue_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bond_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_mass: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_charge: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_neutral: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_dimensions: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_angles: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
    pub solvent_environment: SolventEnvironment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_category: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub residue_composition: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub water_counts: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ion_counts: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solute_residues: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solvent_molecules: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hmr_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hydrogen_mass_range: Option<(f64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hydrogen_mass_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    Text(String),
    Int(i64),
    Real(f64),
    Missing,
}

impl Field {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Field::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Field::Real(f) => Some(*f),
            Field::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Field::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldCode {
    Text,
    Int,
    Real,
}

#[derive(Debug, Clone, Copy)]
struct FortranFormat {
    per_line: usize,
    code: FieldCode,
    width: usize,
}

static FORMAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\s*(\d+)\s*([aiefAIEF])\s*(\d+)(?:\.\d+)?\s*\)").unwrap()
});

fn parse_format(descriptor: &str) -> Option<FortranFormat> {
    let caps = FORMAT_RE.captures(descriptor)?;
    let per_line: usize = caps[1].parse().ok()?;
    let code = match caps[2].to_ascii_uppercase().as_str() {
        "A" => FieldCode::Text,
        "I" => FieldCode::Int,
        _ => FieldCode::Real,
    };
    let width: usize = caps[3].parse().ok()?;
    if per_line == 0 || width == 0 {
        return None;
    }
    Some(FortranFormat {
        per_line,
        code,
        width,
    })
}

fn slice_field(line: &str, start: usize, end: usize) -> Option<&str> {
    if start >= line.len() {
        return None;
    }
    Some(line.get(start..end).unwrap_or(&line[start..]))
}

fn convert_field(token: &str, code: FieldCode, malformed: &mut usize) -> Field {
    let trimmed = token.trim();
    match code {
        // Text chunks stay untrimmed so joined sections (titles) keep their
        // internal spacing; consumers trim at the use site.
        FieldCode::Text => Field::Text(token.to_string()),
        FieldCode::Int => match trimmed.parse::<i64>() {
            Ok(i) => Field::Int(i),
            Err(_) if trimmed.is_empty() => Field::Missing,
            Err(_) => {
                *malformed += 1;
                Field::Missing
            }
        },
        FieldCode::Real => {
            if trimmed.is_empty() {
                return Field::Missing;
            }
            let rewritten = trimmed.replace(['d', 'D'], "e");
            match rewritten.parse::<f64>() {
                Ok(f) if f.is_finite() => Field::Real(f),
                _ => {
                    *malformed += 1;
                    Field::Missing
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct SectionTable {
    version: Option<String>,
    sections: HashMap<String, Vec<Field>>,
    malformed: BTreeMap<String, usize>,
}

impl SectionTable {
    fn get(&self, flag: &str) -> Option<&Vec<Field>> {
        self.sections.get(flag)
    }

    fn joined_text(&self, flag: &str) -> Option<String> {
        let fields = self.get(flag)?;
        let joined: String = fields.iter().filter_map(Field::as_str).collect();
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

fn read_sections(path: &Path) -> Result<SectionTable, ParseError> {
    let file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut table = SectionTable::default();
    let mut current_flag: Option<String> = None;
    let mut format: Option<FortranFormat> = None;

    for line in reader.lines() {
        let line = line.map_err(|e| ParseError::io(path, e))?;

        if line.starts_with("%VERSION") {
            if let Some((_, rest)) = line.split_once('=') {
                table.version = rest.split_whitespace().next().map(str::to_string);
            }
            continue;
        }
        if line.starts_with("%FLAG") {
            let flag = line.split_whitespace().nth(1).map(str::to_string);
            current_flag = flag.filter(|f| TARGET_FLAGS.contains(&f.as_str()));
            format = None;
            continue;
        }
        if line.starts_with("%FORMAT") {
            let descriptor = line.split_once("FORMAT").map(|(_, d)| d).unwrap_or("");
            format = parse_format(descriptor);
            if format.is_none() {
                current_flag = None;
            }
            continue;
        }
        if line.starts_with("%COMMENT") {
            continue;
        }

        let (Some(flag), Some(fmt)) = (current_flag.as_deref(), format) else {
            continue;
        };
        let mut malformed = 0usize;
        let entry = table.sections.entry(flag.to_string()).or_default();
        for k in 0..fmt.per_line {
            let start = k * fmt.width;
            let Some(token) = slice_field(&line, start, start + fmt.width) else {
                break;
            };
            entry.push(convert_field(token, fmt.code, &mut malformed));
        }
        if malformed > 0 {
            *table.malformed.entry(flag.to_string()).or_default() += malformed;
        }
    }

    Ok(table)
}

fn classify_system(record: &TopologyRecord) -> String {
    let mut has_protein = false;
    let mut has_dna = false;
    let mut has_rna = false;
    let mut has_lipid = false;
    let mut has_water = false;
    let mut has_organic = false;
    let mut has_unknown = false;

    for name in record.residue_composition.keys() {
        let res = name.as_str();
        if PROTEIN_RESNAMES.contains(res)
            || (res.len() == 4 && PROTEIN_RESNAMES.contains(&res[1..]))
        {
            has_protein = true;
        } else if DNA_RESNAMES.contains(res) {
            has_dna = true;
        } else if RNA_RESNAMES.contains(res) {
            has_rna = true;
        } else if LIPID_RESNAMES.contains(res) {
            has_lipid = true;
        } else if WATER_RESNAMES.contains(res) {
            has_water = true;
        } else if ORGANIC_SOLVENT_RESNAMES.contains(res) {
            has_organic = true;
        } else if !ION_RESNAMES.contains(res) {
            has_unknown = true;
        }
    }

    let mut solutes: Vec<&str> = Vec::new();
    if has_protein {
        solutes.push("Protein");
    }
    if has_dna {
        solutes.push("DNA");
    }
    if has_rna {
        solutes.push("RNA");
    }
    if has_lipid {
        solutes.push("Lipid/Membrane");
    }
    if has_unknown {
        solutes.push(if solutes.is_empty() {
            "Small Molecule / Ligand"
        } else {
            "Ligand"
        });
    }
    let solute_str = if solutes.is_empty() {
        "Pure Solvent/Ions".to_string()
    } else {
        solutes.join(" / ")
    };

    let solvent_context = match record.solvent_environment {
        SolventEnvironment::Implicit => "in Implicit Solvent",
        SolventEnvironment::Vacuum => "in Vacuum",
        SolventEnvironment::Explicit => {
            if has_water && has_organic {
                "in Mixed Solvent (Water+Organic)"
            } else if has_water {
                "in Explicit Water"
            } else if has_organic {
                "in Organic Solvent"
            } else {
                "in Explicit Solvent (Unknown)"
            }
        }
    };

    format!("{solute_str} {solvent_context}")
}

/// Parses an AMBER topology file into a [`TopologyRecord`].
///
/// # Errors
///
/// Returns [`ParseError::Io`] when the file cannot be read and
/// [`ParseError::UnrecognizedFormat`] when it contains no `%FLAG` sections
/// at all. Everything else degrades to warnings with fields left absent.
pub fn parse(path: &Path) -> Result<Parsed<TopologyRecord>, ParseError> {
    let table = read_sections(path)?;
    if table.version.is_none() && table.sections.is_empty() {
        return Err(ParseError::UnrecognizedFormat {
            path: path.to_path_buf(),
            expected: "an AMBER topology (%FLAG sections)",
        });
    }

    let mut warnings: Vec<String> = table
        .malformed
        .iter()
        .map(|(flag, n)| format!("{n} malformed field(s) in %FLAG {flag} treated as absent"))
        .collect();

    let mut record = TopologyRecord {
        version: table.version.clone(),
        ..TopologyRecord::default()
    };

    if let Some(title) = table.joined_text("TITLE") {
        record.title = Some(title);
    }
    if let Some(ctitle) = table.joined_text("CTITLE") {
        record.title = Some(ctitle);
        record
            .force_field_features
            .push("CHAMBER (CHARMM converted)".to_string());
    }
    record.force_field_type = table.joined_text("FORCE_FIELD_TYPE");
    if table.get("CMAP_COUNT").is_some() {
        record.force_field_features.push("CMAP Correction".to_string());
    }

    if let Some(pointers) = table.get("POINTERS") {
        record.atom_count = pointers.first().and_then(Field::as_i64).map(|v| v as u64);
        record.residue_count = pointers.get(11).and_then(Field::as_i64).map(|v| v as u64);
        record.bond_count = pointers.get(12).and_then(Field::as_i64).map(|v| v as u64);
    } else {
        warnings.push("POINTERS section missing; system dimensions unavailable".to_string());
    }

    if let Some(charges) = table.get("CHARGE") {
        let sum: f64 = charges.iter().filter_map(Field::as_f64).sum();
        let total = sum / CHARGE_UNIT;
        record.total_charge = Some(total);
        record.is_neutral = Some(total.abs() < NEUTRALITY_THRESHOLD);
    }

    let masses: Option<Vec<Option<f64>>> = table
        .get("MASS")
        .map(|fields| fields.iter().map(Field::as_f64).collect());
    if let Some(masses) = &masses {
        record.total_mass = Some(masses.iter().flatten().sum());
    }

    if let (Some(masses), Some(numbers)) = (&masses, table.get("ATOMIC_NUMBER")) {
        let hydrogen_masses: Vec<f64> = masses
            .iter()
            .zip(numbers.iter())
            .filter(|(_, z)| z.as_i64() == Some(1))
            .filter_map(|(m, _)| *m)
            .collect();
        if hydrogen_masses.is_empty() {
            record.hmr_active = Some(false);
        } else {
            let min = hydrogen_masses.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = hydrogen_masses
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max);
            record.hydrogen_mass_range = Some((min, max));
            record.hydrogen_mass_summary = Some(format!(
                "{min:.3}-{max:.3} amu across {} H",
                hydrogen_masses.len()
            ));
            let redistributed = max >= 1.5 && min <= 1.1;
            record.hmr_active = Some(max >= 2.0 || redistributed);
        }
    }

    if let Some(box_data) = table.get("BOX_DIMENSIONS") {
        let values: Vec<Option<f64>> = box_data.iter().map(Field::as_f64).collect();
        match (
            values.first().copied().flatten(),
            values.get(1).copied().flatten(),
            values.get(2).copied().flatten(),
            values.get(3).copied().flatten(),
        ) {
            (Some(beta), Some(a), Some(b), Some(c)) => {
                record.box_dimensions = Some([a, b, c]);
                record.box_angles = Some([90.0, beta, 90.0]);
                let volume = a * b * c;
                record.box_volume = Some(volume);
                if let Some(mass) = record.total_mass {
                    record.density = geometry::density_g_per_cm3(mass, volume);
                }
                record.force_field_features.push(if (beta - 90.0).abs() > 0.01 {
                    "Truncated Octahedron/Triclinic".to_string()
                } else {
                    "Orthorhombic Box".to_string()
                });
                record.solvent_environment = SolventEnvironment::Explicit;
            }
            _ => warnings.push("BOX_DIMENSIONS section incomplete; box ignored".to_string()),
        }
    } else if let Some(radius_set) = table.joined_text("RADIUS_SET") {
        record.solvent_environment = SolventEnvironment::Implicit;
        record
            .force_field_features
            .push(format!("GB Radii: {radius_set}"));
    }

    if let Some(labels) = table.get("RESIDUE_LABEL") {
        for label in labels.iter().filter_map(Field::as_str) {
            let name = label.trim();
            if name.is_empty() {
                continue;
            }
            *record.residue_composition.entry(name.to_string()).or_default() += 1;
        }
        let mut ion_total = 0u64;
        for (name, count) in &record.residue_composition {
            if WATER_RESNAMES.contains(name.as_str()) {
                record.water_counts.insert(name.clone(), *count);
            }
            if ION_RESNAMES.contains(name.as_str()) {
                record.ion_counts.insert(name.clone(), *count);
                ion_total += count;
            }
        }
        if ion_total > 0 {
            record
                .force_field_features
                .push(format!("Contains Ions ({ion_total})"));
        }
    }

    if let Some(pointers) = table.get("SOLVENT_POINTERS") {
        record.solute_residues = pointers.first().and_then(Field::as_i64).map(|v| v as u64);
        record.solvent_molecules = pointers.get(2).and_then(Field::as_i64).map(|v| v as u64);
    }

    record.system_category = Some(classify_system(&record));

    Ok(Parsed {
        path: path.to_path_buf(),
        warnings,
        record,
    })
}
