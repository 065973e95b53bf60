//! Built-in limit types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::config::{AdPolicy, LimitDefinition};
use super::types::{Allowance, ResetPeriod};

/// Allowance granted to test accounts for generation limits
pub const TEST_ACCOUNT_GENERATIONS: u32 = 100;

/// Limit types shipped with the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// Messages per character per day
    Conversation,
    /// Voice playbacks per character
    Voice,
    /// Photo generations
    Photos,
    /// Video generations
    Videos,
    /// Character creations per month
    CharacterCreation,
}

impl LimitKind {
    pub const ALL: [LimitKind; 5] = [
        LimitKind::Conversation,
        LimitKind::Voice,
        LimitKind::Photos,
        LimitKind::Videos,
        LimitKind::CharacterCreation,
    ];

    pub fn field_name(&self) -> &'static str {
        match self {
            LimitKind::Conversation => "conversation",
            LimitKind::Voice => "voice",
            LimitKind::Photos => "photos",
            LimitKind::Videos => "videos",
            LimitKind::CharacterCreation => "character_creation",
        }
    }

    pub fn definition(&self) -> LimitDefinition {
        let field = self.field_name();
        match self {
            LimitKind::Conversation => LimitDefinition::new("conversation limit", "conversation", conversation_limit)
                .with_field_name(field)
                .with_reset_period(ResetPeriod::Daily)
                .per_character()
                .allow_guest()
                .with_test_account_limit(Allowance::Unlimited)
                .with_ad_policy(AdPolicy::default()),
            LimitKind::Voice => LimitDefinition::new("voice limit", "voice", voice_limit)
                .with_field_name(field)
                .with_reset_period(ResetPeriod::Lifetime)
                .per_character()
                .with_test_account_limit(Allowance::Unlimited)
                .with_ad_policy(AdPolicy::default()),
            LimitKind::Photos => LimitDefinition::new("photo limit", "photos", photo_limit)
                .with_field_name(field)
                .with_reset_period(ResetPeriod::None)
                .with_test_account_limit(Allowance::Limited(TEST_ACCOUNT_GENERATIONS)),
            LimitKind::Videos => LimitDefinition::new("video limit", "videos", video_limit)
                .with_field_name(field)
                .with_reset_period(ResetPeriod::None)
                .with_test_account_limit(Allowance::Limited(TEST_ACCOUNT_GENERATIONS)),
            LimitKind::CharacterCreation => {
                LimitDefinition::new("character creation limit", "character creation", creation_limit)
                    .with_field_name(field)
                    .with_reset_period(ResetPeriod::Monthly)
                    .with_test_account_limit(Allowance::Limited(TEST_ACCOUNT_GENERATIONS))
            }
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.field_name())
    }
}

impl FromStr for LimitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "conversation" | "message" | "messages" => Ok(LimitKind::Conversation),
            "voice" => Ok(LimitKind::Voice),
            "photos" | "photo" => Ok(LimitKind::Photos),
            "videos" | "video" => Ok(LimitKind::Videos),
            "character_creation" | "characters" => Ok(LimitKind::CharacterCreation),
            _ => Err(format!("Unknown limit type: {}", s)),
        }
    }
}

// ============================================================================
// Tier Tables
// ============================================================================

fn conversation_limit(tier: &str) -> Allowance {
    match tier {
        "vvip" => Allowance::Limited(50),
        "vip" => Allowance::Limited(20),
        _ => Allowance::Limited(10),
    }
}

fn voice_limit(tier: &str) -> Allowance {
    match tier {
        "vip" | "vvip" => Allowance::Unlimited,
        _ => Allowance::Limited(10),
    }
}

// paid tiers draw photo and video allowance from addons
fn photo_limit(tier: &str) -> Allowance {
    match tier {
        "vip" | "vvip" => Allowance::Limited(0),
        _ => Allowance::Limited(3),
    }
}

fn video_limit(_tier: &str) -> Allowance {
    Allowance::Limited(0)
}

fn creation_limit(_tier: &str) -> Allowance {
    Allowance::Limited(3)
}
