pub mod grid;
pub mod light_groups;
pub mod metis_partitioning;
pub mod partitioning;
pub mod road_network;
pub mod routing;
