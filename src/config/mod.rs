//! Option loading from parameter trees.
//!
//! Each `update_*` function overwrites only the options a [`ParamList`]
//! names, so callers start from defaults and layer parameters on top.
//! Names the loaders do not recognize are rejected, as are enumeration
//! values outside their closed set.
//!
//! ```
//! use mesh_adapt::adapt::AdaptOpts;
//! use mesh_adapt::config::{update_adapt_opts, ParamList};
//!
//! let pl: ParamList = serde_json::from_str(r#"{"Max Length Desired": 2.0, "Swap": false}"#).unwrap();
//! let mut opts = AdaptOpts::default();
//! update_adapt_opts(&mut opts, &pl).unwrap();
//! assert_eq!(opts.max_length_desired, 2.0);
//! assert!(!opts.should_swap);
//! ```

pub mod error;
pub mod params;

pub use error::ConfigError;
pub use params::{ParamList, ParamValue};

use crate::adapt::{AdaptOpts, Verbosity};
use crate::metric::{MetricInput, MetricSource, MetricSourceKind};
use crate::transfer::{TransferOpts, TransferPolicy, VarCompareOpts};

/// Reject entries of `pl` outside `allowed`.
fn check_names(pl: &ParamList, allowed: &[&str], context: &str) -> Result<(), ConfigError> {
    match pl.iter().find(|(name, _)| !allowed.contains(name)) {
        Some((name, _)) => Err(ConfigError::UnknownParameter {
            list: context.to_owned(),
            name: name.to_owned(),
        }),
        None => Ok(()),
    }
}

fn set_real(dst: &mut f64, pl: &ParamList, name: &str) -> Result<(), ConfigError> {
    if let Some(x) = pl.get_real(name)? {
        *dst = x;
    }
    Ok(())
}

fn set_bool(dst: &mut bool, pl: &ParamList, name: &str) -> Result<(), ConfigError> {
    if let Some(b) = pl.get_bool(name)? {
        *dst = b;
    }
    Ok(())
}

fn set_count(dst: &mut usize, pl: &ParamList, name: &str) -> Result<(), ConfigError> {
    if let Some(n) = pl.get_count(name)? {
        *dst = n;
    }
    Ok(())
}

fn unknown(kind: &'static str, param: &str, value: &str) -> ConfigError {
    ConfigError::UnknownEnum {
        kind,
        param: param.to_owned(),
        value: value.to_owned(),
    }
}

/// Every entry of `pl` must itself be a sublist; yields them in order.
fn sublists<'a>(pl: &'a ParamList) -> Result<Vec<(&'a str, &'a ParamList)>, ConfigError> {
    pl.iter()
        .map(|(name, value)| match value {
            ParamValue::List(sub) => Ok((name, sub)),
            _ => Err(ConfigError::ExpectedSublist(name.to_owned())),
        })
        .collect()
}

const COMPARE_NAMES: &[&str] = &["Type", "Tolerance", "Floor"];

/// Apply a "Diffusion Convergence" sublist.
pub fn update_var_compare_opts(opts: &mut VarCompareOpts, pl: &ParamList) -> Result<(), ConfigError> {
    check_names(pl, COMPARE_NAMES, "Diffusion Convergence")?;
    let (mut tolerance, mut floor) = match *opts {
        VarCompareOpts::None => (0.0, 0.0),
        VarCompareOpts::Relative { tolerance, floor } | VarCompareOpts::Absolute { tolerance, floor } => {
            (tolerance, floor)
        }
    };
    set_real(&mut tolerance, pl, "Tolerance")?;
    set_real(&mut floor, pl, "Floor")?;
    let kind = match pl.get_str("Type")? {
        Some(name) => name,
        None => match opts {
            VarCompareOpts::None => "None",
            VarCompareOpts::Relative { .. } => "Relative",
            VarCompareOpts::Absolute { .. } => "Absolute",
        },
    };
    *opts = match kind {
        "None" => VarCompareOpts::None,
        "Relative" => VarCompareOpts::Relative { tolerance, floor },
        "Absolute" => VarCompareOpts::Absolute { tolerance, floor },
        other => return Err(unknown("comparison type", "Type", other)),
    };
    Ok(())
}

fn parse_policy(name: &str) -> Result<TransferPolicy, ConfigError> {
    Ok(match name {
        "Inherit" => TransferPolicy::Inherit,
        "Linear Interp" => TransferPolicy::LinearInterp,
        "Metric" => TransferPolicy::Metric,
        "Conserve" => TransferPolicy::Conserve,
        "Momentum Velocity" => TransferPolicy::MomentumVelocity,
        "Pointwise" => TransferPolicy::Pointwise,
        other => return Err(unknown("transfer type", "Type", other)),
    })
}

/// Convergence check from an optional "Diffusion Convergence" sublist.
fn convergence(field_pl: &ParamList) -> Result<VarCompareOpts, ConfigError> {
    let mut compare = VarCompareOpts::none();
    if let Some(sub) = field_pl.sublist("Diffusion Convergence")? {
        update_var_compare_opts(&mut compare, sub)?;
    }
    Ok(compare)
}

/// Apply a "Transfer" sublist.
pub fn update_transfer_opts(opts: &mut TransferOpts, pl: &ParamList) -> Result<(), ConfigError> {
    check_names(pl, &["Fields", "Conserve Size"], "Transfer")?;
    if let Some(fields) = pl.sublist("Fields")? {
        for (field, field_pl) in sublists(fields)? {
            check_names(
                field_pl,
                &["Type", "Integral", "Momentum", "Diffusion Convergence"],
                field,
            )?;
            match parse_policy(field_pl.require_str("Type")?)? {
                TransferPolicy::Conserve => {
                    let integral = field_pl.require_str("Integral")?;
                    let compare = convergence(field_pl)?;
                    opts.set_conserve(field, integral, compare);
                }
                TransferPolicy::MomentumVelocity => {
                    let momentum = field_pl.get_str("Momentum")?.unwrap_or("momentum");
                    let compare = convergence(field_pl)?;
                    opts.set_momentum_velocity(field, momentum, compare);
                }
                policy => {
                    opts.set_policy(field, policy);
                }
            }
        }
    }
    set_bool(&mut opts.should_conserve_size, pl, "Conserve Size")?;
    Ok(())
}

const ADAPT_NAMES: &[&str] = &[
    "Min Length Desired",
    "Max Length Desired",
    "Max Length Allowed",
    "Min Quality Allowed",
    "Min Quality Desired",
    "Sliver Layer Count",
    "Verbosity",
    "Length Histogram Min",
    "Length Histogram Max",
    "Length Histogram Bin Count",
    "Quality Histogram Bin Count",
    "Max Motion Steps",
    "Motion Step Size",
    "Refine",
    "Coarsen",
    "Swap",
    "Coarsen Slivers",
    "Move For Quality",
    "Allow Pinching",
    "Max Sweeps",
    "Max Rounds Per Pass",
    "Max Motion Backtracks",
    "Motion Gradient Step",
    "Volume Tolerance",
    "Check Invariants",
    "Metric Name",
    "Transfer",
];

/// Apply an adapt parameter list, including its "Transfer" sublist.
pub fn update_adapt_opts(opts: &mut AdaptOpts, pl: &ParamList) -> Result<(), ConfigError> {
    check_names(pl, ADAPT_NAMES, "Adapt")?;
    set_real(&mut opts.min_length_desired, pl, "Min Length Desired")?;
    set_real(&mut opts.max_length_desired, pl, "Max Length Desired")?;
    set_real(&mut opts.max_length_allowed, pl, "Max Length Allowed")?;
    set_real(&mut opts.min_quality_allowed, pl, "Min Quality Allowed")?;
    set_real(&mut opts.min_quality_desired, pl, "Min Quality Desired")?;
    set_count(&mut opts.nsliver_layers, pl, "Sliver Layer Count")?;
    if let Some(name) = pl.get_str("Verbosity")? {
        opts.verbosity = match name {
            "Silent" => Verbosity::Silent,
            "Each Adapt" => Verbosity::EachAdapt,
            "Each Rebuild" => Verbosity::EachRebuild,
            "Extra Stats" => Verbosity::ExtraStats,
            other => return Err(unknown("verbosity level", "Verbosity", other)),
        };
    }
    set_real(&mut opts.length_histogram_min, pl, "Length Histogram Min")?;
    set_real(&mut opts.length_histogram_max, pl, "Length Histogram Max")?;
    set_count(&mut opts.nlength_histogram_bins, pl, "Length Histogram Bin Count")?;
    set_count(&mut opts.nquality_histogram_bins, pl, "Quality Histogram Bin Count")?;
    set_count(&mut opts.max_motion_steps, pl, "Max Motion Steps")?;
    set_real(&mut opts.motion_step_size, pl, "Motion Step Size")?;
    set_count(&mut opts.max_motion_backtracks, pl, "Max Motion Backtracks")?;
    set_real(&mut opts.motion_gradient_step, pl, "Motion Gradient Step")?;
    set_real(&mut opts.volume_tolerance, pl, "Volume Tolerance")?;
    set_bool(&mut opts.should_refine, pl, "Refine")?;
    set_bool(&mut opts.should_coarsen, pl, "Coarsen")?;
    set_bool(&mut opts.should_swap, pl, "Swap")?;
    set_bool(&mut opts.should_coarsen_slivers, pl, "Coarsen Slivers")?;
    set_bool(&mut opts.should_move_for_quality, pl, "Move For Quality")?;
    set_bool(&mut opts.should_allow_pinching, pl, "Allow Pinching")?;
    set_count(&mut opts.max_sweeps, pl, "Max Sweeps")?;
    set_count(&mut opts.max_rounds_per_pass, pl, "Max Rounds Per Pass")?;
    set_bool(&mut opts.should_check_invariants, pl, "Check Invariants")?;
    if let Some(name) = pl.get_str("Metric Name")? {
        opts.metric_name = name.to_owned();
    }
    if let Some(sub) = pl.sublist("Transfer")? {
        update_transfer_opts(&mut opts.xfer_opts, sub)?;
    }
    Ok(())
}

/// Build one metric source from its sublist.
pub fn get_metric_source(pl: &ParamList) -> Result<MetricSource, ConfigError> {
    check_names(pl, &["Type", "Scale", "Tag Name", "Knob"], "Sources")?;
    let kind = match pl.require_str("Type")? {
        "Hessian" => MetricSourceKind::Hessian,
        "Given" => MetricSourceKind::Given,
        "Implied" => MetricSourceKind::Implied,
        "Proximity" => MetricSourceKind::Proximity,
        "Curvature" => MetricSourceKind::Curvature,
        other => return Err(unknown("metric source type", "Type", other)),
    };
    let should_scale = pl.get_bool("Scale")?.unwrap_or(true);
    let tag_name = pl.get_str("Tag Name")?.unwrap_or_default();
    if kind.needs_tag() && tag_name.is_empty() {
        return Err(ConfigError::MissingEntry("Tag Name".to_owned()));
    }
    let mut source = MetricSource::new(kind, should_scale, tag_name);
    source.knob = pl.get_real("Knob")?;
    Ok(source)
}

const METRIC_NAMES: &[&str] = &[
    "Sources",
    "Limit Lengths",
    "Max Length",
    "Min Length",
    "Limit Gradation",
    "Max Gradation Rate",
    "Gradation Convergence Tolerance",
    "Max Gradation Iterations",
    "Limit Element Count",
    "Max Element Count",
    "Min Element Count",
    "Element Count Over-Relaxation",
    "Max Element Count Iterations",
    "Smoothing Steps",
    "Metric Name",
];

/// Apply a metric parameter list; sources are appended in list order.
pub fn update_metric_input(input: &mut MetricInput, pl: &ParamList) -> Result<(), ConfigError> {
    check_names(pl, METRIC_NAMES, "Metric")?;
    if let Some(sources) = pl.sublist("Sources")? {
        for (_, source_pl) in sublists(sources)? {
            input.sources.push(get_metric_source(source_pl)?);
        }
    }
    set_bool(&mut input.should_limit_lengths, pl, "Limit Lengths")?;
    set_real(&mut input.max_length, pl, "Max Length")?;
    set_real(&mut input.min_length, pl, "Min Length")?;
    set_bool(&mut input.should_limit_gradation, pl, "Limit Gradation")?;
    set_real(&mut input.max_gradation_rate, pl, "Max Gradation Rate")?;
    set_real(&mut input.gradation_convergence_tolerance, pl, "Gradation Convergence Tolerance")?;
    set_count(&mut input.max_gradation_iterations, pl, "Max Gradation Iterations")?;
    set_bool(&mut input.should_limit_element_count, pl, "Limit Element Count")?;
    set_real(&mut input.max_element_count, pl, "Max Element Count")?;
    set_real(&mut input.min_element_count, pl, "Min Element Count")?;
    set_real(&mut input.element_count_over_relaxation, pl, "Element Count Over-Relaxation")?;
    set_count(&mut input.max_element_count_iterations, pl, "Max Element Count Iterations")?;
    set_count(&mut input.nsmoothing_steps, pl, "Smoothing Steps")?;
    if let Some(name) = pl.get_str("Metric Name")? {
        input.metric_name = name.to_owned();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> ParamList {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn adapt_options_layer_over_defaults() {
        let pl = parse(
            r#"{
                "Min Length Desired": 0.5,
                "Sliver Layer Count": 2,
                "Verbosity": "Extra Stats",
                "Move For Quality": true,
                "Max Length Allowed": 8,
                "Max Rounds Per Pass": 12,
                "Volume Tolerance": 1e-8
            }"#,
        );
        let mut opts = AdaptOpts::default();
        update_adapt_opts(&mut opts, &pl).unwrap();
        assert_eq!(opts.min_length_desired, 0.5);
        assert_eq!(opts.max_length_allowed, 8.0);
        assert_eq!(opts.nsliver_layers, 2);
        assert_eq!(opts.verbosity, Verbosity::ExtraStats);
        assert!(opts.should_move_for_quality);
        assert_eq!(opts.max_rounds_per_pass, 12);
        assert_eq!(opts.volume_tolerance, 1e-8);
        assert_eq!(opts.max_length_desired, AdaptOpts::default().max_length_desired);
    }

    #[test]
    fn unknown_names_and_values_are_rejected() {
        let mut opts = AdaptOpts::default();
        let err = update_adapt_opts(&mut opts, &parse(r#"{"Verbosity": "Loud"}"#)).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEnum { ref value, .. } if value == "Loud"));
        let err = update_adapt_opts(&mut opts, &parse(r#"{"Min Lenght Desired": 0.5}"#)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownParameter {
                list: "Adapt".to_owned(),
                name: "Min Lenght Desired".to_owned(),
            }
        );
        let err = update_adapt_opts(&mut opts, &parse(r#"{"Refine": 1}"#)).unwrap_err();
        assert!(matches!(err, ConfigError::WrongType { expected: "bool", .. }));
    }

    #[test]
    fn transfer_fields_configure_policies_and_integrals() {
        let pl = parse(
            r#"{
                "Fields": {
                    "density": {
                        "Type": "Conserve",
                        "Integral": "mass",
                        "Diffusion Convergence": {"Type": "Relative", "Tolerance": 1e-6, "Floor": 1e-12}
                    },
                    "velocity": {"Type": "Momentum Velocity"},
                    "temperature": {"Type": "Linear Interp"}
                },
                "Conserve Size": true
            }"#,
        );
        let mut opts = TransferOpts::default();
        update_transfer_opts(&mut opts, &pl).unwrap();
        assert_eq!(opts.policy("temperature"), TransferPolicy::LinearInterp);
        assert_eq!(
            opts.integral_of("density"),
            Some((
                "mass",
                VarCompareOpts::Relative {
                    tolerance: 1e-6,
                    floor: 1e-12
                }
            ))
        );
        assert_eq!(opts.integral_of("velocity"), Some(("momentum", VarCompareOpts::None)));
        assert!(opts.should_conserve_size);
        opts.validate().unwrap();
    }

    #[test]
    fn transfer_structure_errors() {
        let mut opts = TransferOpts::default();
        let err = update_transfer_opts(&mut opts, &parse(r#"{"Fields": {"density": "Conserve"}}"#)).unwrap_err();
        assert_eq!(err, ConfigError::ExpectedSublist("density".to_owned()));
        let err = update_transfer_opts(&mut opts, &parse(r#"{"Fields": {"density": {"Type": "Conserve"}}}"#))
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingEntry("Integral".to_owned()));
        let err = update_transfer_opts(&mut opts, &parse(r#"{"Fields": {"u": {"Type": "Spline"}}}"#)).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEnum { .. }));
    }

    #[test]
    fn comparison_type_keeps_prior_tolerance() {
        let mut compare = VarCompareOpts::Absolute {
            tolerance: 0.5,
            floor: 0.0,
        };
        update_var_compare_opts(&mut compare, &parse(r#"{"Type": "Relative", "Floor": 2}"#)).unwrap();
        assert_eq!(
            compare,
            VarCompareOpts::Relative {
                tolerance: 0.5,
                floor: 2.0
            }
        );
        update_var_compare_opts(&mut compare, &parse(r#"{"Type": "None"}"#)).unwrap();
        assert_eq!(compare, VarCompareOpts::None);
    }

    #[test]
    fn metric_sources_load_in_order() {
        let pl = parse(
            r#"{
                "Sources": {
                    "solution": {"Type": "Hessian", "Tag Name": "u", "Knob": 0.02},
                    "walls": {"Type": "Proximity", "Scale": false}
                },
                "Limit Lengths": true,
                "Max Length": 0.5,
                "Limit Element Count": true,
                "Max Element Count": 1000
            }"#,
        );
        let mut input = MetricInput::default();
        update_metric_input(&mut input, &pl).unwrap();
        assert_eq!(input.sources.len(), 2);
        assert_eq!(input.sources[0].kind, MetricSourceKind::Hessian);
        assert_eq!(input.sources[0].tag_name, "u");
        assert_eq!(input.sources[0].knob, Some(0.02));
        assert!(input.sources[0].should_scale);
        assert_eq!(input.sources[1].kind, MetricSourceKind::Proximity);
        assert!(!input.sources[1].should_scale);
        assert_eq!(input.sources[1].knob, None);
        assert!(input.should_limit_lengths);
        assert_eq!(input.max_length, 0.5);
        assert_eq!(input.max_element_count, 1000.0);
        input.validate().unwrap();
    }

    #[test]
    fn metric_source_requires_a_type() {
        let err = get_metric_source(&parse(r#"{"Tag Name": "u"}"#)).unwrap_err();
        assert_eq!(err, ConfigError::MissingEntry("Type".to_owned()));
        let err = get_metric_source(&parse(r#"{"Type": "Given"}"#)).unwrap_err();
        assert_eq!(err, ConfigError::MissingEntry("Tag Name".to_owned()));
    }
}
