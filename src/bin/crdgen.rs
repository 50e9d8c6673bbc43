// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! CRD YAML Generator
//!
//! Generates Kubernetes CRD YAML from the Rust types in `src/crd/`.
//!
//! Usage:
//!   cargo run --bin crdgen                 # print all CRDs to stdout
//!   cargo run --bin crdgen -- deploy/crds  # write one file per CRD
//!
//! Generated files carry the copyright header and must not be edited by hand.

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use std::fs;
use std::path::Path;
use svcat::crd::{
    ClusterServiceBroker, ClusterServiceClass, ClusterServicePlan, ServiceBinding, ServiceBroker,
    ServiceClass, ServiceInstance, ServicePlan,
};

const COPYRIGHT_HEADER: &str = "# Copyright (c) 2025 Erick Bourgeois, firestoned
# SPDX-License-Identifier: MIT
#
# This file is AUTO-GENERATED from src/crd/
# DO NOT EDIT MANUALLY - Run `cargo run --bin crdgen -- deploy/crds` to regenerate
#
";

fn main() -> Result<()> {
    let crds = [
        render::<ClusterServiceBroker>()?,
        render::<ServiceBroker>()?,
        render::<ClusterServiceClass>()?,
        render::<ServiceClass>()?,
        render::<ClusterServicePlan>()?,
        render::<ServicePlan>()?,
        render::<ServiceInstance>()?,
        render::<ServiceBinding>()?,
    ];

    let Some(dir) = std::env::args().nth(1) else {
        for (_, yaml) in &crds {
            print!("---\n{yaml}");
        }
        return Ok(());
    };

    let output_dir = Path::new(&dir);
    fs::create_dir_all(output_dir)
        .with_context(|| format!("cannot create {}", output_dir.display()))?;

    println!("Generating CRD YAML files into {}...", output_dir.display());
    for (filename, yaml) in &crds {
        let path = output_dir.join(filename);
        fs::write(&path, format!("{COPYRIGHT_HEADER}{yaml}"))
            .with_context(|| format!("cannot write {}", path.display()))?;
        println!("  ✓ Generated {filename}");
    }
    println!("\nNext steps:");
    println!("  1. Review the generated files");
    println!("  2. Deploy with: kubectl apply -f {}", output_dir.display());

    Ok(())
}

/// File name and YAML body for one CRD.
fn render<T: CustomResourceExt>() -> Result<(String, String)> {
    let filename = format!("{}.crd.yaml", T::api_resource().plural);
    let yaml = serde_yaml::to_string(&T::crd())?;
    Ok((filename, yaml))
}
