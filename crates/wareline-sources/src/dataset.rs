//! Built-in datasets: the schema and entity layout each source feeds

use std::collections::BTreeMap;

use wareline_core::{
    Coercion, DerivedRule, EntityLayout, EntitySpec, FieldDefault, FieldSpec, FieldType, Schema,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dataset {
    /// Playlist tracks from the music catalog
    Tracks,
    /// Country-level development indicators
    Indicators,
    /// Air-quality measurements from a local feed
    Measurements,
}

const REGIONS: [(&str, &str); 7] = [
    ("EG", "Middle East & North Africa"),
    ("SA", "Middle East & North Africa"),
    ("AE", "Middle East & North Africa"),
    ("JO", "Middle East & North Africa"),
    ("NG", "Sub-Saharan Africa"),
    ("ZA", "Sub-Saharan Africa"),
    ("KE", "Sub-Saharan Africa"),
];

const CATEGORIES: [(&str, &str); 7] = [
    ("SP.POP.TOTL", "Demographics"),
    ("NY.GDP.MKTP.CD", "Economy"),
    ("NY.GDP.PCAP.CD", "Economy"),
    ("SP.DYN.LE00.IN", "Health"),
    ("SE.ADT.LITR.ZS", "Education"),
    ("SH.DYN.MORT", "Health"),
    ("EN.ATM.CO2E.PC", "Environment"),
];

fn table(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Dataset {
    pub const ALL: [Dataset; 3] = [Self::Tracks, Self::Indicators, Self::Measurements];

    /// Parse CLI/config string into enum
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "tracks" => Some(Self::Tracks),
            "indicators" => Some(Self::Indicators),
            "measurements" => Some(Self::Measurements),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Tracks => "tracks",
            Self::Indicators => "indicators",
            Self::Measurements => "measurements",
        }
    }

    pub fn schema(self) -> Schema {
        match self {
            Self::Tracks => tracks_schema(),
            Self::Indicators => indicators_schema(),
            Self::Measurements => measurements_schema(),
        }
    }

    pub fn layout(self) -> EntityLayout {
        match self {
            Self::Tracks => tracks_layout(),
            Self::Indicators => indicators_layout(),
            Self::Measurements => measurements_layout(),
        }
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn tracks_schema() -> Schema {
    use FieldType::*;
    Schema::new("tracks", 1)
        .field(FieldSpec::required("track_id", "track.id", String))
        .field(FieldSpec::required("track_name", "track.name", String))
        .field(FieldSpec::optional("artist_id", "track.artists.0.id", String))
        .field(FieldSpec::optional("artist_name", "track.artists.0.name", String))
        .field(FieldSpec::optional("album_id", "track.album.id", String))
        .field(FieldSpec::optional("album_name", "track.album.name", String))
        .field(FieldSpec::optional("duration_ms", "track.duration_ms", Integer))
        .field(
            FieldSpec::optional("duration_sec", "track.duration_ms", Float)
                .with_coercion(Coercion::Divide(1000.0)),
        )
        .field(FieldSpec::optional("popularity", "track.popularity", Integer))
        .field(FieldSpec::optional(
            "external_url",
            "track.external_urls.spotify",
            String,
        ))
        .field(FieldSpec::optional("added_at", "added_at", Timestamp))
        .field(
            FieldSpec::required("extracted_at", "extracted_at", Timestamp)
                .with_default(FieldDefault::RunStarted),
        )
}

fn tracks_layout() -> EntityLayout {
    EntityLayout::new()
        .entity(
            EntitySpec::dimension("artists")
                .key(&["artist_id"])
                .column("artist_name"),
        )
        .entity(
            EntitySpec::dimension("albums")
                .key(&["album_id"])
                .column("album_name"),
        )
        .entity(
            EntitySpec::fact("tracks")
                .key(&["track_id"])
                .column("track_name")
                .column("artist_id")
                .column("album_id")
                .column("duration_ms")
                .column("duration_sec")
                .column("popularity")
                .column("external_url")
                .column("added_at")
                .column("extracted_at")
                .references(&["artist_id"], "artists")
                .references(&["album_id"], "albums"),
        )
}

fn indicators_schema() -> Schema {
    use FieldType::*;
    Schema::new("indicators", 1)
        .field(
            FieldSpec::required("country_id", "country.id", String)
                .with_coercion(Coercion::Uppercase),
        )
        .field(FieldSpec::optional("country_name", "country.value", String))
        .field(FieldSpec::required("indicator_id", "indicator.id", String))
        .field(FieldSpec::optional("indicator_name", "indicator.value", String))
        .field(FieldSpec::required("year", "date", Integer))
        .field(FieldSpec::required("value", "value", Float))
        .field(FieldSpec::optional("unit", "unit", String))
        .field(FieldSpec::optional("obs_status", "obs_status", String))
        .field(
            FieldSpec::required("fetched_at", "fetched_at", Timestamp)
                .with_default(FieldDefault::RunStarted),
        )
        .derive(
            "record_id",
            DerivedRule::Concat {
                fields: vec!["country_id".into(), "indicator_id".into(), "year".into()],
                separator: "_".into(),
            },
        )
        .derive(
            "decade",
            DerivedRule::Bucket {
                field: "year".into(),
                width: 10,
            },
        )
        .derive(
            "region",
            DerivedRule::Lookup {
                field: "country_id".into(),
                table: table(&REGIONS),
            },
        )
        .derive(
            "category",
            DerivedRule::Lookup {
                field: "indicator_id".into(),
                table: table(&CATEGORIES),
            },
        )
}

fn indicators_layout() -> EntityLayout {
    EntityLayout::new()
        .entity(
            EntitySpec::dimension("countries")
                .key(&["country_id"])
                .column("country_name")
                .column("region"),
        )
        .entity(
            EntitySpec::dimension("indicators")
                .key(&["indicator_id"])
                .column("indicator_name")
                .column("category"),
        )
        .entity(
            EntitySpec::fact("observations")
                .key(&["record_id"])
                .column("country_id")
                .column("indicator_id")
                .column("year")
                .column("decade")
                .column("value")
                .column("unit")
                .column("obs_status")
                .column("fetched_at")
                .references(&["country_id"], "countries")
                .references(&["indicator_id"], "indicators"),
        )
}

fn measurements_schema() -> Schema {
    use FieldType::*;
    Schema::new("measurements", 1)
        .field(FieldSpec::required("measurement_id", "measurement_id", String))
        .field(FieldSpec::optional("location", "location", String).with_coercion(Coercion::Trim))
        .field(FieldSpec::optional("city", "city", String))
        .field(FieldSpec::optional("country", "country", String))
        .field(FieldSpec::optional("latitude", "latitude", Float))
        .field(FieldSpec::optional("longitude", "longitude", Float))
        .field(FieldSpec::optional("parameter", "parameter", String).with_coercion(Coercion::Trim))
        .field(FieldSpec::required("value", "value", Float))
        .field(FieldSpec::optional("unit", "unit", String))
        .field(FieldSpec::required("date_utc", "date_utc", Timestamp))
        .field(
            FieldSpec::required("fetched_at", "fetched_at", Timestamp)
                .with_default(FieldDefault::RunStarted),
        )
}

fn measurements_layout() -> EntityLayout {
    EntityLayout::new()
        .entity(
            EntitySpec::dimension("locations")
                .key(&["location"])
                .column("city")
                .column("country")
                .column("latitude")
                .column("longitude"),
        )
        .entity(
            EntitySpec::dimension("parameters")
                .key(&["parameter"])
                .column("unit"),
        )
        .entity(
            EntitySpec::fact("measurements")
                .key(&["measurement_id"])
                .column("location")
                .column("parameter")
                .column("value")
                .column("date_utc")
                .column("fetched_at")
                .references(&["location"], "locations")
                .references(&["parameter"], "parameters"),
        )
}
