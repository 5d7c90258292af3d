use serde::{Deserialize, Serialize};

/// Discord channel flavors the synthesis engine can create.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Text,
    Voice,
    Category,
}

impl ChannelKind {
    /// Discord REST `type` discriminant for channel creation.
    pub fn discord_type(&self) -> u8 {
        match self {
            ChannelKind::Text => 0,
            ChannelKind::Voice => 2,
            ChannelKind::Category => 4,
        }
    }
}

/// Whether a permission overwrite targets a role or a member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverwriteKind {
    Role,
    Member,
}

/// A single channel permission overwrite. Allow/deny are the platform's
/// string-encoded permission bitfields, passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionOverwrite {
    pub target_id: String,
    pub kind: OverwriteKind,
    #[serde(default)]
    pub allow: String,
    #[serde(default)]
    pub deny: String,
}

/// The typed mutation a job performs, tagged by `type` with its payload under
/// `payload` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum JobSpec {
    CreateRole {
        name: String,
        #[serde(default)]
        color: Option<u32>,
        #[serde(default)]
        hoist: bool,
        #[serde(default)]
        mentionable: bool,
        /// String-encoded permission bitfield, platform convention.
        #[serde(default)]
        permissions: Option<String>,
    },
    DeleteRole {
        role_id: String,
    },
    AssignRole {
        user_id: String,
        role_id: String,
    },
    RemoveRole {
        user_id: String,
        role_id: String,
    },
    CreateChannel {
        name: String,
        #[serde(default)]
        kind: ChannelKind,
        #[serde(default)]
        parent_id: Option<String>,
        #[serde(default)]
        topic: Option<String>,
        #[serde(default)]
        overwrites: Vec<PermissionOverwrite>,
    },
    DeleteChannel {
        channel_id: String,
    },
    UpdatePermissions {
        channel_id: String,
        overwrites: Vec<PermissionOverwrite>,
    },
}

impl JobSpec {
    /// Stable snake_case tag, used for metrics labels and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            JobSpec::CreateRole { .. } => "create_role",
            JobSpec::DeleteRole { .. } => "delete_role",
            JobSpec::AssignRole { .. } => "assign_role",
            JobSpec::RemoveRole { .. } => "remove_role",
            JobSpec::CreateChannel { .. } => "create_channel",
            JobSpec::DeleteChannel { .. } => "delete_channel",
            JobSpec::UpdatePermissions { .. } => "update_permissions",
        }
    }
}

/// A durable outbound mutation request.
///
/// `idempotency_key` is caller-supplied and stable across logical retries of
/// the same mutation (e.g. `role:<community>:<tier>`): within the idempotency
/// TTL window the platform-visible side effect executes at most once.
///
/// ```
/// use guildsmith_core::{JobSpec, SynthesisJob};
///
/// let job = SynthesisJob {
///     spec: JobSpec::AssignRole { user_id: "u1".into(), role_id: "r1".into() },
///     guild_id: "g1".into(),
///     community_id: "acme".into(),
///     idempotency_key: "assign:acme:u1:r1".into(),
///     priority: None,
///     delay_ms: None,
/// };
/// let wire = serde_json::to_value(&job).unwrap();
/// assert_eq!(wire["type"], "assign_role");
/// assert_eq!(wire["payload"]["user_id"], "u1");
/// assert_eq!(wire["idempotencyKey"], "assign:acme:u1:r1");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisJob {
    #[serde(flatten)]
    pub spec: JobSpec,
    pub guild_id: String,
    pub community_id: String,
    pub idempotency_key: String,
    /// Advisory: higher runs first when several jobs are ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, rename = "delay", skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

/// Declarative role template inside a [`SynthesisManifest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleTemplate {
    /// Stable key used to derive the idempotency key (`role:<community>:<key>`).
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<u32>,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub mentionable: bool,
    #[serde(default)]
    pub permissions: Option<String>,
}

/// Declarative channel template inside a [`SynthesisManifest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelTemplate {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub kind: ChannelKind,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub overwrites: Vec<PermissionOverwrite>,
}

/// A community's desired guild shape, expanded by the engine into a staggered
/// sequence of synthesis jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SynthesisManifest {
    #[serde(default)]
    pub roles: Vec<RoleTemplate>,
    #[serde(default)]
    pub channels: Vec<ChannelTemplate>,
}

impl SynthesisManifest {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.channels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.roles.len() + self.channels.len()
    }
}
