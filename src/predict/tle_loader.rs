use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::predict::error::PredictError;
use crate::predict::types::{OrbitalElements, SatelliteProfile};

/// Orbital elements read from a folder of TLE files, keyed by catalog id.
pub struct TleLoader {
    tle_dir: PathBuf,
    elements: HashMap<u32, OrbitalElements>,
}

impl TleLoader {
    pub fn new(tle_dir: PathBuf) -> Self {
        Self {
            tle_dir,
            elements: HashMap::new(),
        }
    }

    /// Load every `.tle`/`.txt` file. Unreadable files are skipped.
    pub fn load_all(&mut self) -> Result<(), PredictError> {
        if !self.tle_dir.exists() {
            return Err(PredictError::DirectoryNotFound(
                self.tle_dir.display().to_string(),
            ));
        }

        self.elements.clear();

        for entry in fs::read_dir(&self.tle_dir)? {
            let path = entry?.path();
            let is_tle = path
                .extension()
                .is_some_and(|ext| ext == "tle" || ext == "txt");
            if !path.is_file() || !is_tle {
                continue;
            }
            match load_file(&path) {
                Ok(sets) => {
                    for set in sets {
                        match catalog_id(&set.line1) {
                            Some(id) => {
                                self.elements.insert(id, set);
                            }
                            None => log::warn!(
                                "{}: cannot read catalog number from {:?}",
                                path.display(),
                                set.line1
                            ),
                        }
                    }
                }
                Err(e) => log::warn!("Failed to read TLE file {}: {}", path.display(), e),
            }
        }

        log::info!(
            "Loaded {} element sets from {}",
            self.elements.len(),
            self.tle_dir.display()
        );
        Ok(())
    }

    pub fn get(&self, norad_id: u32) -> Option<&OrbitalElements> {
        self.elements.get(&norad_id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Pair profiles with their elements; profiles without elements are
    /// reported and left out.
    pub fn match_profiles<'a>(
        &'a self,
        profiles: &'a [SatelliteProfile],
    ) -> Vec<(&'a SatelliteProfile, &'a OrbitalElements)> {
        profiles
            .iter()
            .filter(|p| p.enabled)
            .filter_map(|p| match self.get(p.norad_id) {
                Some(elements) => Some((p, elements)),
                None => {
                    log::warn!("No orbital elements for {} ({})", p.name, p.norad_id);
                    None
                }
            })
            .collect()
    }
}

fn load_file(path: &Path) -> Result<Vec<OrbitalElements>, PredictError> {
    let content = fs::read_to_string(path)?;
    Ok(parse_multi_tle(&content))
}

/// Columns 3-7 of line 1 hold the catalog number.
fn catalog_id(line1: &str) -> Option<u32> {
    line1.get(2..7)?.trim().parse().ok()
}

/// Parse content holding any mix of 2-line and 3-line element sets.
pub fn parse_multi_tle(content: &str) -> Vec<OrbitalElements> {
    let lines: Vec<&str> = content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();

    let mut result = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].starts_with("1 ") && i + 1 < lines.len() && lines[i + 1].starts_with("2 ") {
            result.push(OrbitalElements {
                name: None,
                line1: lines[i].to_string(),
                line2: lines[i + 1].to_string(),
            });
            i += 2;
        } else if i + 2 < lines.len()
            && lines[i + 1].starts_with("1 ")
            && lines[i + 2].starts_with("2 ")
        {
            result.push(OrbitalElements {
                name: Some(lines[i].trim_start_matches("0 ").to_string()),
                line1: lines[i + 1].to_string(),
                line2: lines[i + 2].to_string(),
            });
            i += 3;
        } else {
            i += 1;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEATHER: &str = "\
NOAA 19
1 33591U 09005A   24001.50000000  .00000100  00000-0  80000-4 0  9991
2 33591  99.1900  40.0000 0013000 200.0000 160.0000 14.12500000770000

1 40069U 14037A   24001.50000000  .00000050  00000-0  40000-4 0  9992
2 40069  98.5000  50.0000 0005000 100.0000 260.0000 14.21000000490000
garbage line
";

    #[test]
    fn parses_mixed_two_and_three_line_sets() {
        let sets = parse_multi_tle(WEATHER);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].name.as_deref(), Some("NOAA 19"));
        assert_eq!(sets[1].name, None);
        assert_eq!(catalog_id(&sets[0].line1), Some(33591));
        assert_eq!(catalog_id(&sets[1].line1), Some(40069));
    }

    #[test]
    fn loads_folder_and_matches_profiles() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("weather.txt"), WEATHER).unwrap();
        fs::write(dir.path().join("notes.md"), "1 ignored\n2 ignored\n").unwrap();

        let mut loader = TleLoader::new(dir.path().to_path_buf());
        loader.load_all().unwrap();
        assert_eq!(loader.len(), 2);

        let profiles: Vec<SatelliteProfile> = serde_yaml::from_str(
            "
- { name: NOAA 19, norad_id: 33591, frequency_hz: 137100000, signal: apt }
- { name: METEOR, norad_id: 57166, frequency_hz: 137900000, signal: lrpt }
- { name: NOAA 18, norad_id: 40069, frequency_hz: 137912500, signal: apt, enabled: false }
",
        )
        .unwrap();
        let matched = loader.match_profiles(&profiles);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].0.name, "NOAA 19");
    }

    #[test]
    fn missing_folder_is_an_error() {
        let mut loader = TleLoader::new(PathBuf::from("/definitely/not/here"));
        assert!(matches!(
            loader.load_all(),
            Err(PredictError::DirectoryNotFound(_))
        ));
    }
}
