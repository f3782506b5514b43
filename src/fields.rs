use std::fmt;
use std::str::FromStr;

/// Storage and interchange type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A foreign key that serializes as the related object's public identifier.
    Relation,
    Date,
    DateTime,
    Float,
    Integer,
    Text,
    Boolean,
}

macro_rules! fields {
    ($($variant:ident => ($name:literal, $kind:ident),)+) => {
        /// One column of a daily summary statistic row.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Field {
            $($variant,)+
        }

        impl Field {
            /// Every field in canonical order.
            pub const ALL: &'static [Field] = &[$(Field::$variant,)+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Field::$variant => $name,)+
                }
            }

            pub fn kind(self) -> FieldKind {
                match self {
                    $(Field::$variant => FieldKind::$kind,)+
                }
            }
        }

        impl FromStr for Field {
            type Err = UnknownField;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($name => Ok(Field::$variant),)+
                    other => Err(UnknownField(other.to_string())),
                }
            }
        }
    };
}

fields! {
    Participant => ("participant", Relation),
    Study => ("study", Relation),
    Date => ("date", Date),
    DistanceDiameter => ("distance_diameter", Float),
    DistanceFromHome => ("distance_from_home", Float),
    DistanceTravelled => ("distance_travelled", Float),
    FlightDistanceAverage => ("flight_distance_average", Float),
    FlightDistanceStandardDeviation => ("flight_distance_standard_deviation", Float),
    FlightDurationAverage => ("flight_duration_average", Float),
    FlightDurationStandardDeviation => ("flight_duration_standard_deviation", Float),
    GpsDataMissingDuration => ("gps_data_missing_duration", Integer),
    HomeDuration => ("home_duration", Float),
    PhysicalCircadianRhythm => ("physical_circadian_rhythm", Float),
    PhysicalCircadianRhythmStratified => ("physical_circadian_rhythm_stratified", Float),
    RadiusOfGyration => ("radius_of_gyration", Float),
    SignificantLocationCount => ("significant_location_count", Integer),
    SignificantLocationEntropy => ("significant_location_entropy", Float),
    StationaryFraction => ("stationary_fraction", Text),
    TextIncomingCount => ("text_incoming_count", Integer),
    TextIncomingDegree => ("text_incoming_degree", Integer),
    TextIncomingLength => ("text_incoming_length", Integer),
    TextIncomingResponsiveness => ("text_incoming_responsiveness", Integer),
    TextOutgoingCount => ("text_outgoing_count", Integer),
    TextOutgoingDegree => ("text_outgoing_degree", Integer),
    TextOutgoingLength => ("text_outgoing_length", Integer),
    TextReciprocity => ("text_reciprocity", Integer),
    CallIncomingCount => ("call_incoming_count", Integer),
    CallIncomingDegree => ("call_incoming_degree", Integer),
    CallIncomingDuration => ("call_incoming_duration", Float),
    CallIncomingResponsiveness => ("call_incoming_responsiveness", Integer),
    CallOutgoingCount => ("call_outgoing_count", Integer),
    CallOutgoingDegree => ("call_outgoing_degree", Integer),
    CallOutgoingDuration => ("call_outgoing_duration", Float),
    AccelerationDirection => ("acceleration_direction", Text),
    AccelerometerCoverageFraction => ("accelerometer_coverage_fraction", Text),
    AccelerometerSignalVariability => ("accelerometer_signal_variability", Text),
    AccelerometerUnivariateSummaries => ("accelerometer_univariate_summaries", Float),
    DeviceProximity => ("device_proximity", Boolean),
    TotalPowerEvents => ("total_power_events", Integer),
    TotalScreenEvents => ("total_screen_events", Integer),
    TotalUnlockEvents => ("total_unlock_events", Integer),
    AwakeOnsetTime => ("awake_onset_time", DateTime),
    SleepDuration => ("sleep_duration", Integer),
    SleepOnsetTime => ("sleep_onset_time", DateTime),
}

impl Field {
    /// Fields stored in the per-record metric map, i.e. everything but the
    /// two relations and the date.
    pub fn metrics() -> impl Iterator<Item = Field> {
        Field::ALL.iter().copied().filter(|field| field.is_metric())
    }

    pub fn is_metric(self) -> bool {
        !matches!(self, Field::Participant | Field::Study | Field::Date)
    }

    /// Column backing this field in `summary_statistics_daily`.
    pub fn column(self) -> &'static str {
        match self {
            Field::Participant => "participant_id",
            Field::Study => "study_id",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} is not a known field")]
pub struct UnknownField(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_starts_with_identifiers() {
        assert_eq!(Field::ALL.len(), 44);
        assert_eq!(Field::ALL[0], Field::Participant);
        assert_eq!(Field::ALL[1], Field::Study);
        assert_eq!(Field::ALL[2], Field::Date);
        assert_eq!(Field::ALL[43], Field::SleepOnsetTime);
        assert_eq!(Field::metrics().count(), 41);
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for field in Field::ALL {
            assert_eq!(field.as_str().parse::<Field>(), Ok(*field));
        }
        assert!("distance_traveled".parse::<Field>().is_err());
    }

    #[test]
    fn positions_follow_declaration_order() {
        for (index, field) in Field::ALL.iter().enumerate() {
            assert_eq!(*field as usize, index);
        }
    }

    #[test]
    fn relations_map_to_foreign_key_columns() {
        assert_eq!(Field::Participant.column(), "participant_id");
        assert_eq!(Field::Study.column(), "study_id");
        assert_eq!(Field::SleepDuration.column(), "sleep_duration");
        assert_eq!(Field::DeviceProximity.kind(), FieldKind::Boolean);
    }
}
