//! Exclusion filter and target volume computation

use hush_common::{FilterRule, Settings, VolumeMode};

use crate::backend::SessionIdentity;

/// Decide whether a session must never be ducked
///
/// Sessions of our own process are excluded when configured. Otherwise only
/// one filter list is consulted: with `use_included_filter` a session is
/// excluded unless a rule matches, without it a session is excluded when a
/// rule matches.
pub fn is_excluded(settings: &Settings, identity: &SessionIdentity, own_pid: u32) -> bool {
    if settings.exclude_own_process && identity.process_id == own_pid {
        return true;
    }

    let matched = settings
        .active_filter()
        .iter()
        .any(|rule| rule_matches(rule, identity));

    if settings.use_included_filter {
        !matched
    } else {
        matched
    }
}

fn rule_matches(rule: &FilterRule, identity: &SessionIdentity) -> bool {
    match rule {
        FilterRule::ProcessId(pid) => *pid == identity.process_id,
        FilterRule::Name(name) => {
            let needle = name.trim().to_lowercase();
            if needle.is_empty() {
                return false;
            }
            identity.group_id.to_lowercase().contains(&needle)
                || identity.display_name.to_lowercase().contains(&needle)
        }
    }
}

/// Volume a session with this default volume is ducked to
pub fn target_volume(settings: &Settings, default_volume: f32) -> f32 {
    let target = match settings.volume_mode {
        VolumeMode::Percentage => default_volume * (1.0 - settings.volume_reduction),
        VolumeMode::Fixed => 1.0 - settings.volume_reduction,
    };
    target.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(pid: u32, group: &str) -> SessionIdentity {
        SessionIdentity {
            process_id: pid,
            group_id: format!(
                "{{0.0.0.00000000}}.{{guid}}|\\Device\\HarddiskVolume3\\Apps\\{}",
                group
            ),
            instance_id: format!("{}%b1", group),
            display_name: group.to_string(),
        }
    }

    #[test]
    fn test_own_process_excluded() {
        let settings = Settings::default();
        assert!(is_excluded(&settings, &identity(7, "us.exe"), 7));
        assert!(!is_excluded(&settings, &identity(8, "game.exe"), 7));

        let settings = Settings {
            exclude_own_process: false,
            ..Default::default()
        };
        assert!(!is_excluded(&settings, &identity(7, "us.exe"), 7));
    }

    #[test]
    fn test_excluded_filter_by_name_is_case_insensitive() {
        let settings = Settings {
            excluded_filter: vec![FilterRule::Name("SPOTIFY".to_string())],
            ..Default::default()
        };
        assert!(is_excluded(&settings, &identity(10, "Spotify.exe"), 1));
        assert!(!is_excluded(&settings, &identity(11, "game.exe"), 1));
    }

    #[test]
    fn test_excluded_filter_by_pid() {
        let settings = Settings {
            excluded_filter: vec![FilterRule::ProcessId(11)],
            ..Default::default()
        };
        assert!(is_excluded(&settings, &identity(11, "game.exe"), 1));
        assert!(!is_excluded(&settings, &identity(12, "game.exe"), 1));
    }

    #[test]
    fn test_included_filter_excludes_everything_else() {
        let settings = Settings {
            use_included_filter: true,
            included_filter: vec![FilterRule::Name("game".to_string())],
            // ignored while the include list is in effect
            excluded_filter: vec![FilterRule::Name("game".to_string())],
            ..Default::default()
        };
        assert!(!is_excluded(&settings, &identity(10, "game.exe"), 1));
        assert!(is_excluded(&settings, &identity(11, "music.exe"), 1));
    }

    #[test]
    fn test_empty_name_rule_never_matches() {
        let settings = Settings {
            excluded_filter: vec![FilterRule::Name("  ".to_string())],
            ..Default::default()
        };
        assert!(!is_excluded(&settings, &identity(10, "game.exe"), 1));
    }

    #[test]
    fn test_percentage_target() {
        let settings = Settings::default();
        assert!((target_volume(&settings, 0.8) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_negative_percentage_raises_but_caps_at_one() {
        let settings = Settings {
            volume_reduction: -0.5,
            ..Default::default()
        };
        assert!((target_volume(&settings, 0.5) - 0.75).abs() < 1e-6);
        assert_eq!(target_volume(&settings, 0.9), 1.0);
    }

    #[test]
    fn test_fixed_target_ignores_default() {
        let settings = Settings {
            volume_mode: VolumeMode::Fixed,
            volume_reduction: 0.7,
            ..Default::default()
        };
        assert!((target_volume(&settings, 0.2) - 0.3).abs() < 1e-6);
        assert!((target_volume(&settings, 1.0) - 0.3).abs() < 1e-6);
    }
}
