//! Identity and time types shared across the workflow
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum Role {
    /// A collection agency account.
    #[n(0)]
    User,
    #[n(1)]
    Admin,
    #[n(2)]
    SuperAdmin,
    #[n(3)]
    Auditor,
    #[n(4)]
    CollectionManager,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::Auditor => "AUDITOR",
            Role::CollectionManager => "COLLECTION_MANAGER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Role::User),
            "ADMIN" => Ok(Role::Admin),
            "SUPER_ADMIN" => Ok(Role::SuperAdmin),
            "AUDITOR" => Ok(Role::Auditor),
            "COLLECTION_MANAGER" => Ok(Role::CollectionManager),
            other => Err(anyhow::anyhow!("unknown role {other}")),
        }
    }
}

/// Where a request came from. Recorded on activity entries and CM approvals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// An authenticated session handed to us by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
    pub client: ClientInfo,
}

impl Session {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            client: ClientInfo::default(),
        }
    }
    pub fn with_client(mut self, ip_address: &str, user_agent: &str) -> Self {
        self.client = ClientInfo {
            ip_address: Some(ip_address.to_string()),
            user_agent: Some(user_agent.to_string()),
        };
        self
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Nanoseconds since the epoch, clamped at zero. Used to build ordered store keys.
    pub fn sort_key(&self) -> u64 {
        self.0.timestamp_nanos_opt().unwrap_or_default().max(0) as u64
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
