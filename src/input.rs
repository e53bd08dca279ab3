use json::JsonValue;
use log::info;

use crate::{
    datatypes::{AnalysisType, ElementKind, ElementParams, ForceSpec, IntegrationRule, MaterialParams, Vertex},
    driver::{OptimizerParams, Settings},
    error::TopOptError,
    linalg::LinearSolver,
    material::MaterialModel,
    mesher::{EdgeMarkers, PointMarker, Rectangle},
    optimizer::Method,
    solver::NewtonConfig,
};

/// Number of leading positional settings that have no default
const REQUIRED_SETTINGS: usize = 5;

pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Everything needed to set up and run one optimization
#[derive(Debug, Clone)]
pub struct ProblemDefinition {
    pub settings: Settings,
    pub geometry: Rectangle,
    pub element_kind: ElementKind,
    pub material: MaterialModel,
    pub material_params: MaterialParams,
    pub element_params: ElementParams,
    pub supports: Vec<u32>,
    pub force: ForceSpec,
    pub body_load: Option<[f64; 2]>,
    pub newton: NewtonConfig,
    pub optimizer: OptimizerParams,
}

fn bad_value(section: &str, key: &str) -> TopOptError {
    TopOptError::Input(format!("Bad value for {key} in {section} section"))
}

fn required_f64(json: &JsonValue, section: &str, key: &str) -> Result<f64, TopOptError> {
    if !json.has_key(key) {
        return Err(TopOptError::Input(format!(
            "Input json missing {key} field in {section} section"
        )));
    }
    json[key].as_f64().ok_or_else(|| bad_value(section, key))
}

fn optional_f64(json: &JsonValue, section: &str, key: &str, default: f64) -> Result<f64, TopOptError> {
    if !json.has_key(key) {
        return Ok(default);
    }
    json[key].as_f64().ok_or_else(|| bad_value(section, key))
}

fn optional_usize(
    json: &JsonValue,
    section: &str,
    key: &str,
    default: usize,
) -> Result<usize, TopOptError> {
    if !json.has_key(key) {
        return Ok(default);
    }
    json[key].as_usize().ok_or_else(|| bad_value(section, key))
}

fn optional_bool(json: &JsonValue, section: &str, key: &str, default: bool) -> Result<bool, TopOptError> {
    if !json.has_key(key) {
        return Ok(default);
    }
    json[key].as_bool().ok_or_else(|| bad_value(section, key))
}

/// Parses the input json into a JsonValue object
///
/// # Arguments
/// * `input_file` - The path to the input file
///
/// # Returns
/// A JsonValue object
pub fn load_input_file(input_file: &str) -> Result<JsonValue, TopOptError> {
    let file_string = match std::fs::read_to_string(input_file) {
        Ok(f) => f,
        Err(err) => {
            return Err(TopOptError::Input(format!(
                "Unable to open input file {input_file}: {err}"
            )))
        }
    };

    let input_file_json = match json::parse(&file_string) {
        Ok(f) => f,
        Err(err) => {
            return Err(TopOptError::Input(format!(
                "Error in input file json: {err}"
            )))
        }
    };

    for section in ["settings", "geometry", "material", "supports", "force"] {
        if !input_file_json.has_key(section) {
            return Err(TopOptError::Input(format!(
                "Input json missing {section} field"
            )));
        }
    }

    Ok(input_file_json)
}

/// Normalizes a marker argument, which may be a single marker or a list
///
/// # Arguments
/// * `json` - The marker value
/// * `name` - Name of the field, for error messages
pub fn parse_markers(json: &JsonValue, name: &str) -> Result<Vec<u32>, TopOptError> {
    if let Some(marker) = json.as_u32() {
        return Ok(vec![marker]);
    }
    if json.is_array() && !json.is_empty() {
        return json
            .members()
            .map(|m| {
                m.as_u32().ok_or_else(|| {
                    TopOptError::Input(format!("Marker {m} in {name} is not a non-negative integer"))
                })
            })
            .collect();
    }
    Err(TopOptError::Input(format!(
        "{name} must be a marker or a non-empty list of markers"
    )))
}

/// Reads the run settings, either as an object or as the positional array
/// `[volume_fraction, mesh_size, filter_radius, change_limit, penalty, method, debug]`.
///
/// The first five values are required. `method` falls back to OC and `debug`
/// to false.
///
/// # Arguments
/// * `json` - The settings value
///
/// # Returns
/// Validated Settings
pub fn parse_settings(json: &JsonValue) -> Result<Settings, TopOptError> {
    let settings = if json.is_array() {
        if json.len() < REQUIRED_SETTINGS {
            return Err(TopOptError::Config(format!(
                "Insufficient settings: expected at least {REQUIRED_SETTINGS} values, got {}",
                json.len()
            )));
        }
        let number = |i: usize, name: &str| -> Result<f64, TopOptError> {
            json[i]
                .as_f64()
                .ok_or_else(|| TopOptError::Input(format!("Setting {i} ({name}) must be a number")))
        };
        let method = match json[5].as_str() {
            Some(name) => Method::from_name(name)?,
            None if json[5].is_null() => Method::OptimalityCriteria,
            None => return Err(TopOptError::Input("Setting 5 (method) must be a string".to_owned())),
        };
        let debug = match json[6].as_bool() {
            Some(flag) => flag,
            None if json[6].is_null() => false,
            None => return Err(TopOptError::Input("Setting 6 (debug) must be a boolean".to_owned())),
        };

        Settings {
            volume_fraction: number(0, "volume_fraction")?,
            mesh_size: number(1, "mesh_size")?,
            filter_radius: number(2, "filter_radius")?,
            change_limit: number(3, "change_limit")?,
            penalty: number(4, "penalty")?,
            method,
            debug,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    } else if json.is_object() {
        for key in ["volume_fraction", "mesh_size", "filter_radius", "change_limit", "penalty"] {
            if !json.has_key(key) {
                return Err(TopOptError::Config(format!(
                    "Insufficient settings: missing {key}"
                )));
            }
        }
        let method = match json["method"].as_str() {
            Some(name) => Method::from_name(name)?,
            None if json["method"].is_null() => Method::OptimalityCriteria,
            None => return Err(bad_value("settings", "method")),
        };

        Settings {
            volume_fraction: required_f64(json, "settings", "volume_fraction")?,
            mesh_size: required_f64(json, "settings", "mesh_size")?,
            filter_radius: required_f64(json, "settings", "filter_radius")?,
            change_limit: required_f64(json, "settings", "change_limit")?,
            penalty: required_f64(json, "settings", "penalty")?,
            method,
            debug: optional_bool(json, "settings", "debug", false)?,
            max_iterations: optional_usize(json, "settings", "max_iterations", DEFAULT_MAX_ITERATIONS)?,
        }
    } else {
        return Err(TopOptError::Config(
            "Settings must be an object or an array".to_owned(),
        ));
    };

    settings.validate()?;
    Ok(settings)
}

fn parse_geometry(json: &JsonValue) -> Result<(Rectangle, ElementKind), TopOptError> {
    let kind = match json["element"].as_str().unwrap_or("tri") {
        "tri" | "tri3" | "triangle" => ElementKind::Tri3,
        "quad" | "quad4" | "quadrilateral" => ElementKind::Quad4,
        other => {
            return Err(TopOptError::Config(format!(
                "Unrecognized element shape '{other}', expected tri or quad"
            )))
        }
    };

    let edge = |key: &str| -> Result<Option<u32>, TopOptError> {
        let value = &json["edge_markers"][key];
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_u32()
            .map(Some)
            .ok_or_else(|| bad_value("geometry.edge_markers", key))
    };
    let edges = EdgeMarkers {
        bottom: edge("bottom")?,
        right: edge("right")?,
        top: edge("top")?,
        left: edge("left")?,
    };

    let mut points: Vec<PointMarker> = Vec::new();
    for point in json["point_markers"].members() {
        points.push(PointMarker {
            vertex: Vertex {
                x: required_f64(point, "geometry.point_markers", "x")?,
                y: required_f64(point, "geometry.point_markers", "y")?,
            },
            marker: point["marker"]
                .as_u32()
                .ok_or_else(|| bad_value("geometry.point_markers", "marker"))?,
        });
    }

    let rectangle = Rectangle {
        width: required_f64(json, "geometry", "width")?,
        height: required_f64(json, "geometry", "height")?,
        edges,
        points,
    };
    Ok((rectangle, kind))
}

fn parse_material(json: &JsonValue) -> Result<(MaterialModel, MaterialParams), TopOptError> {
    let model = MaterialModel::from_name(json["model"].as_str().unwrap_or("elastic"))?;
    let mut params = MaterialParams::new(
        required_f64(json, "material", "youngs_modulus")?,
        required_f64(json, "material", "poisson_ratio")?,
        optional_f64(json, "material", "yield_strain", 0.0)?,
    );
    params.hardening_ratio = optional_f64(json, "material", "hardening_ratio", params.hardening_ratio)?;
    params.stiffening = optional_f64(json, "material", "stiffening", params.stiffening)?;
    params.validate()?;

    if matches!(model, MaterialModel::Bilinear) && params.yield_strain == 0.0 {
        return Err(TopOptError::Config(
            "The bilinear model needs a positive yield_strain".to_owned(),
        ));
    }
    Ok((model, params))
}

fn parse_element(json: &JsonValue, material: &MaterialModel) -> Result<ElementParams, TopOptError> {
    let defaults = ElementParams::default();
    let analysis = match json["analysis"].as_i64() {
        Some(code) => AnalysisType::from_code(code)?,
        None => defaults.analysis,
    };
    let integration = match json["integration"].as_i64() {
        Some(code) => IntegrationRule::from_code(code)?,
        None => defaults.integration,
    };
    Ok(ElementParams {
        analysis,
        integration,
        thickness: optional_f64(json, "element", "thickness", defaults.thickness)?,
        linear: optional_bool(json, "element", "linear", material.is_linear())?,
    })
}

/// Reads a force given either as an object or as `[magnitude, markers, direction]`
fn parse_force(json: &JsonValue) -> Result<ForceSpec, TopOptError> {
    let (magnitude, markers, direction) = if json.is_array() {
        if json.len() != 3 {
            return Err(TopOptError::Input(
                "Force array must hold magnitude, markers and direction".to_owned(),
            ));
        }
        (&json[0], &json[1], &json[2])
    } else {
        (&json["magnitude"], &json["markers"], &json["direction"])
    };

    Ok(ForceSpec {
        magnitude: magnitude.as_f64().ok_or_else(|| bad_value("force", "magnitude"))?,
        markers: parse_markers(markers, "force markers")?,
        direction: direction.as_u8().ok_or_else(|| bad_value("force", "direction"))?,
    })
}

fn parse_body_load(json: &JsonValue) -> Result<Option<[f64; 2]>, TopOptError> {
    if json.is_null() {
        return Ok(None);
    }
    match (json[0].as_f64(), json[1].as_f64()) {
        (Some(bx), Some(by)) if json.len() == 2 => Ok(Some([bx, by])),
        _ => Err(TopOptError::Input(
            "body_load must be a pair of numbers".to_owned(),
        )),
    }
}

fn parse_solver(json: &JsonValue) -> Result<NewtonConfig, TopOptError> {
    let defaults = NewtonConfig::default();
    let linear_solver = match json["linear_solver"].as_str() {
        Some(name) => LinearSolver::from_name(name)?,
        None => defaults.linear_solver,
    };
    Ok(NewtonConfig {
        tolerance: optional_f64(json, "solver", "tolerance", defaults.tolerance)?,
        max_iterations: optional_usize(json, "solver", "max_iterations", defaults.max_iterations)?,
        linear_solver,
    })
}

fn parse_optimizer(json: &JsonValue) -> Result<OptimizerParams, TopOptError> {
    let mut params = OptimizerParams::default();
    let oc = &mut params.oc;

    oc.move_limit = optional_f64(json, "optimizer", "move_limit", oc.move_limit)?;
    oc.x_min = optional_f64(json, "optimizer", "x_min", oc.x_min)?;
    oc.tolerance = optional_f64(json, "optimizer", "bisection_tolerance", oc.tolerance)?;
    oc.max_bisections = optional_usize(json, "optimizer", "max_bisections", oc.max_bisections)?;
    oc.strict = optional_bool(json, "optimizer", "strict", oc.strict)?;
    if json.has_key("lambda_bounds") {
        match (json["lambda_bounds"][0].as_f64(), json["lambda_bounds"][1].as_f64()) {
            (Some(lower), Some(upper)) if lower >= 0.0 && upper > lower => {
                oc.lambda_lower = lower;
                oc.lambda_upper = upper;
            }
            _ => return Err(bad_value("optimizer", "lambda_bounds")),
        }
    }

    if !(oc.move_limit > 0.0 && oc.move_limit <= 1.0) {
        return Err(TopOptError::Config(format!(
            "Move limit must lie in (0, 1], got {}",
            oc.move_limit
        )));
    }
    if !(oc.x_min > 0.0 && oc.x_min < 1.0) {
        return Err(TopOptError::Config(format!(
            "x_min must lie in (0, 1), got {}",
            oc.x_min
        )));
    }

    params.mma.move_limit = oc.move_limit;
    params.mma.x_min = oc.x_min;
    Ok(params)
}

/// Builds a ProblemDefinition from a loaded input file
///
/// # Arguments
/// * `input_json` - The input file as a JsonValue object
pub fn parse_problem(input_json: &JsonValue) -> Result<ProblemDefinition, TopOptError> {
    let settings = parse_settings(&input_json["settings"])?;
    let (geometry, element_kind) = parse_geometry(&input_json["geometry"])?;
    let (material, material_params) = parse_material(&input_json["material"])?;
    let element_params = parse_element(&input_json["element"], &material)?;
    let optimizer = parse_optimizer(&input_json["optimizer"])?;

    if settings.volume_fraction < optimizer.oc.x_min {
        return Err(TopOptError::Config(format!(
            "Volume fraction {} is below x_min {}",
            settings.volume_fraction, optimizer.oc.x_min
        )));
    }

    let problem = ProblemDefinition {
        settings,
        geometry,
        element_kind,
        material,
        material_params,
        element_params,
        supports: parse_markers(&input_json["supports"], "supports")?,
        force: parse_force(&input_json["force"])?,
        body_load: parse_body_load(&input_json["body_load"])?,
        newton: parse_solver(&input_json["solver"])?,
        optimizer,
    };

    info!(
        "loaded problem: {} x {} domain, {} material, volume fraction {}",
        problem.geometry.width,
        problem.geometry.height,
        problem.material.name(),
        problem.settings.volume_fraction
    );
    Ok(problem)
}
