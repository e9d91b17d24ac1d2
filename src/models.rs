use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::geometry::Geometry;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Department {
    pub id: i64,
    pub fdid: Option<String>,
    pub name: String,
    pub slug: String,
    pub state: Option<String>,
    pub region: Option<String>,
    pub population: Option<i64>,
    pub population_class: Option<i16>,
    pub featured: bool,
    pub dist_model_score: Option<f64>,
    pub risk_model_deaths: Option<f64>,
    pub risk_model_injuries: Option<f64>,
    pub risk_model_fires_size1_percentage: Option<f64>,
    pub risk_model_fires_size2_percentage: Option<f64>,
    pub residential_fires_avg_3_years: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StationAddress {
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub state_province: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Station {
    pub id: i64,
    pub department_id: Option<i64>,
    pub name: String,
    pub station_number: Option<i32>,
    pub address: Option<StationAddress>,
    pub fdid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geom: Option<Geometry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub district: Option<Geometry>,
}

/// Apparatus types in the order their columns appear in a shapefile export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Apparatus {
    Engine,
    Ladder,
    Quint,
    AmbulanceAls,
    AmbulanceBls,
    HeavyRescue,
    Boat,
    Hazmat,
    Chief,
    Other,
}

impl Apparatus {
    pub const ALL: [Apparatus; 10] = [
        Apparatus::Engine,
        Apparatus::Ladder,
        Apparatus::Quint,
        Apparatus::AmbulanceAls,
        Apparatus::AmbulanceBls,
        Apparatus::HeavyRescue,
        Apparatus::Boat,
        Apparatus::Hazmat,
        Apparatus::Chief,
        Apparatus::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Apparatus::Engine => "engine",
            Apparatus::Ladder => "ladder",
            Apparatus::Quint => "quint",
            Apparatus::AmbulanceAls => "ambulance_als",
            Apparatus::AmbulanceBls => "ambulance_bls",
            Apparatus::HeavyRescue => "heavy_rescue",
            Apparatus::Boat => "boat",
            Apparatus::Hazmat => "hazmat",
            Apparatus::Chief => "chief",
            Apparatus::Other => "other",
        }
    }

    /// dBase column names are capped at 10 characters, so aliases stay short
    /// enough to take a `_N` suffix.
    pub fn shapefile_alias(self) -> &'static str {
        match self {
            Apparatus::Engine => "engine",
            Apparatus::Ladder => "truck",
            Apparatus::Quint => "quint",
            Apparatus::AmbulanceAls => "als",
            Apparatus::AmbulanceBls => "bls",
            Apparatus::HeavyRescue => "rescue",
            Apparatus::Boat => "boat",
            Apparatus::Hazmat => "hazmat",
            Apparatus::Chief => "chief",
            Apparatus::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Apparatus::ALL
            .into_iter()
            .find(|apparatus| apparatus.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaffingRecord {
    pub id: i64,
    pub station_id: i64,
    pub apparatus: Apparatus,
    pub personnel: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ExportRow {
    pub station: Station,
    pub geometry: Option<Geometry>,
    pub staffing: Vec<StaffingRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernmentUnitKind {
    County,
    IncorporatedPlace,
    MinorCivilDivision,
    NativeAmericanArea,
    Reserve,
    UnincorporatedPlace,
}

impl GovernmentUnitKind {
    pub const ALL: [GovernmentUnitKind; 6] = [
        GovernmentUnitKind::County,
        GovernmentUnitKind::UnincorporatedPlace,
        GovernmentUnitKind::Reserve,
        GovernmentUnitKind::NativeAmericanArea,
        GovernmentUnitKind::MinorCivilDivision,
        GovernmentUnitKind::IncorporatedPlace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GovernmentUnitKind::County => "county",
            GovernmentUnitKind::IncorporatedPlace => "incorporated_place",
            GovernmentUnitKind::MinorCivilDivision => "minor_civil_division",
            GovernmentUnitKind::NativeAmericanArea => "native_american_area",
            GovernmentUnitKind::Reserve => "reserve",
            GovernmentUnitKind::UnincorporatedPlace => "unincorporated_place",
        }
    }

    /// Name of the repeated form field carrying selections of this kind.
    pub fn form_field(self) -> &'static str {
        match self {
            GovernmentUnitKind::County => "counties",
            GovernmentUnitKind::IncorporatedPlace => "incorporated_places",
            GovernmentUnitKind::MinorCivilDivision => "minor_civil_divisions",
            GovernmentUnitKind::NativeAmericanArea => "native_american_areas",
            GovernmentUnitKind::Reserve => "reserves",
            GovernmentUnitKind::UnincorporatedPlace => "unincorporated_places",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        GovernmentUnitKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
    }

    pub fn from_form_field(field: &str) -> Option<Self> {
        GovernmentUnitKind::ALL
            .into_iter()
            .find(|kind| kind.form_field() == field)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernmentUnit {
    pub kind: GovernmentUnitKind,
    pub id: i64,
    pub name: String,
    #[serde(skip)]
    pub geom: Option<Geometry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GovernmentUnitLink {
    pub department_id: i64,
    pub kind: GovernmentUnitKind,
    pub unit_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub is_active: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub last_login: Option<DateTime<Utc>>,
}

/// Profile data used to create or refresh a user signing in through SSO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DistExtremes {
    pub dist_max: Option<f64>,
    pub dist_min: Option<f64>,
    pub population_max: i64,
    pub population_min: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InventoryStats {
    pub stations: i64,
    pub departments: i64,
    pub stations_with_fdid: i64,
    pub stations_with_departments: i64,
    pub departments_without_government_unit: i64,
}
