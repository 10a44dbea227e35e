//! File templates: campaign descriptors and grouped submission files.

use std::path::{Path, PathBuf};

use prodstat_core::write_text_atomic;
use prodstat_types::{ProdstatError, ProdstatResult};
use tracing::{info, warn};

use crate::descriptor::CampaignDescriptor;

fn write_file(path: &Path, content: &str) -> ProdstatResult<()> {
    write_text_atomic(path, content).map_err(|error| {
        ProdstatError::file(path.display(), std::io::Error::other(format!("{error:#}")))
    })
}

/// Writes a campaign descriptor to `path`.
pub fn write_campaign_yaml(path: &Path, descriptor: &CampaignDescriptor) -> ProdstatResult<()> {
    write_file(path, &descriptor.to_yaml()?)?;
    info!(path = %path.display(), steps = descriptor.steps.len(), "campaign descriptor written");
    Ok(())
}

/// Parameters of `make-prod-groups`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRequest {
    /// `all` (or `f`) keeps every band.
    pub band: String,
    pub group_size: usize,
    pub skip_groups: usize,
    pub max_groups: usize,
}

impl GroupRequest {
    fn keeps_every_band(&self) -> bool {
        matches!(self.band.as_str(), "all" | "f")
    }
}

/// `<band> <exposure id>` lines, sorted by exposure id.
pub fn parse_exposure_list(raw: &str, location: &str) -> ProdstatResult<Vec<(String, u64)>> {
    let mut exposures = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let mut fields = line.split_whitespace();
        let (Some(band), Some(exposure)) = (fields.next(), fields.next()) else {
            if !line.trim().is_empty() {
                warn!(location, line = index + 1, "exposure line ignored");
            }
            continue;
        };
        let exposure = exposure.parse::<u64>().map_err(|error| {
            ProdstatError::InvalidInput(format!(
                "{location}:{}: exposure id '{exposure}': {error}",
                index + 1
            ))
        })?;
        exposures.push((band.to_string(), exposure));
    }
    exposures.sort_by_key(|(_, exposure)| *exposure);
    Ok(exposures)
}

/// Output name stem: the template's file stem when it is a `.yaml` file,
/// else its whole file name.
fn output_base(template: &Path) -> String {
    let is_yaml = template
        .extension()
        .is_some_and(|extension| extension == "yaml");
    let name = if is_yaml {
        template.file_stem()
    } else {
        template.file_name()
    };
    name.map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "group".to_string())
}

/// Splits the exposure list into groups of `group_size` and writes one
/// filled-in template per group into `out_dir`.
///
/// Placeholders `GNUM`, `BAND`, `LOWEXP` and `HIGHEXP` are replaced; group
/// numbers start at 1. Groups past the end of the list are not written.
pub fn make_prod_groups(
    template: &Path,
    exposure_list: &Path,
    request: &GroupRequest,
    out_dir: &Path,
) -> ProdstatResult<Vec<PathBuf>> {
    if request.group_size == 0 {
        return Err(ProdstatError::InvalidInput(
            "group size must be greater than 0".to_string(),
        ));
    }
    let content = std::fs::read_to_string(template)
        .map_err(|error| ProdstatError::file(template.display(), error))?;
    let raw = std::fs::read_to_string(exposure_list)
        .map_err(|error| ProdstatError::file(exposure_list.display(), error))?;
    let exposures: Vec<u64> = parse_exposure_list(&raw, &exposure_list.display().to_string())?
        .into_iter()
        .filter(|(band, _)| request.keeps_every_band() || *band == request.band)
        .map(|(_, exposure)| exposure)
        .collect();

    let base = output_base(template);
    let mut written = Vec::new();
    for (group_id, group) in exposures
        .chunks(request.group_size)
        .enumerate()
        .skip(request.skip_groups)
        .take(request.max_groups)
    {
        let (Some(low), Some(high)) = (group.first(), group.last()) else {
            continue;
        };
        let group_number = group_id + 1;
        let filled = content
            .replace("GNUM", &group_number.to_string())
            .replace("BAND", &request.band)
            .replace("LOWEXP", &low.to_string())
            .replace("HIGHEXP", &high.to_string());
        let path = out_dir.join(format!("{base}_{}_{group_number}.yaml", request.band));
        write_file(&path, &filled)?;
        written.push(path);
    }
    let requested = request.max_groups;
    if written.len() < requested {
        warn!(
            requested,
            written = written.len(),
            exposures = exposures.len(),
            "exposure list ran out before the last requested group"
        );
    }
    info!(groups = written.len(), band = %request.band, "submission groups written");
    Ok(written)
}
